pub mod accessor;
pub mod config;
pub mod domain {
    pub mod event;
    pub mod obligation;
}
pub mod gateway;
pub mod http {
    pub mod handlers {
        pub mod webhook;
    }
}
pub mod lock {
    pub mod redis;
}
pub mod service {
    pub mod balance;
    pub mod events;
    pub mod gate;
    pub mod sweeper;
}
pub mod store;

use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<service::gate::IngestionGate>,
}
