#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    #[error(
        "insufficient stock for material {material_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        material_id: String,
        requested: i64,
        available: i64,
    },
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
}
