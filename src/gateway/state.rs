use std::sync::Arc;

use crate::deps::LedgerCore;
use crate::webhook::WebhookIngress;

/// Gateway shared state
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<LedgerCore>,
    pub webhook: WebhookIngress,
    pub jwt_secret: String,
    /// Where `/auth/callback` sends the browser back to
    pub web_ui_url: String,
}

impl AppState {
    pub fn new(core: Arc<LedgerCore>, webhook: WebhookIngress, jwt_secret: String, web_ui_url: String) -> Self {
        Self {
            core,
            webhook,
            jwt_secret,
            web_ui_url,
        }
    }
}
