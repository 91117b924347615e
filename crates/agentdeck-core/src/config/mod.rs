mod settings;

pub use settings::{
    Command, Config, NetworkAction, Settings, StreamSettings, SyncSettings, API_BASE_ENV,
};
