use dialog_core::TreeError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("no node is selected")]
    NothingSelected,

    #[error("node {0} cannot be selected")]
    NotSelectable(Uuid),
}

pub type Result<T> = std::result::Result<T, GraphError>;
