use std::sync::Arc;

use crate::driver::TrafficControllerDriver;

#[derive(Clone)]
pub struct AppState {
    pub driver: Arc<TrafficControllerDriver>,
}

impl AppState {
    pub fn new(driver: Arc<TrafficControllerDriver>) -> Self {
        Self { driver }
    }
}
