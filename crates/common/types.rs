pub mod account;
pub mod block;

pub use account::{full_account, full_account_rlp, slim_account_rlp, AccountState};
pub use block::{
    parse_commit_sig_and_bitmap, Block, BlockHeader, CommitSigError, CommitSignature,
    BLS_SIGNATURE_BYTES,
};
