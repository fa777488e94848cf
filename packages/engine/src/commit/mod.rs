mod generate;
mod types;

pub use generate::generate_commit;
pub use types::{
    ChangeRow, DomainChangeInput, GenerateCommitArgs, GenerateCommitResult, MaterializedRow,
    VersionContext,
};
