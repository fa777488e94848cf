mod maintenance;

pub(crate) use maintenance::{
    ensure_timeline, refresh_file_history, MaintenanceLocks,
};
