use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrieError {
    #[error("trie builder was already committed")]
    AlreadyCommitted,
    #[error("inconsistent trie node: {0}")]
    InconsistentNode(String),
    #[error("{0}")]
    Custom(String),
}
