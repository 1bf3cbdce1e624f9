pub mod apply;
pub mod delete;
pub mod get;
pub mod list;
pub mod run;

use instanceflow_config::Settings;
use instanceflow_controlplane::FileStore;

pub(crate) fn open_store(settings: &Settings) -> FileStore {
    FileStore::new(&settings.state_dir)
}
