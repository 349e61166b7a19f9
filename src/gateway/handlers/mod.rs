//! HTTP handlers, one file per audience

pub mod operator;
pub mod owner;
pub mod platform;
pub mod principal;
pub mod public;

use serde::Deserialize;

use crate::core_types::{PrincipalId, ShopId};
use crate::deps::LedgerCore;
use crate::error::{LedgerError, LedgerResult};
use crate::models::Shop;

const DEFAULT_PAGE: usize = 20;
const MAX_PAGE: usize = 100;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

impl PageQuery {
    /// `(offset, limit)` with 1-based pages
    pub fn window(&self) -> (usize, usize) {
        let size = self.page_size.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
        let page = self.page.unwrap_or(1).max(1);
        ((page - 1) * size, size)
    }
}

#[derive(Debug, Deserialize)]
pub struct AuditBody {
    #[serde(default)]
    pub remark: Option<String>,
}

/// Shop that belongs to `owner_id`; foreign shops read as missing
pub(crate) async fn owned_shop(core: &LedgerCore, shop_id: ShopId, owner_id: PrincipalId) -> LedgerResult<Shop> {
    let shop = core.shops.get(shop_id).await?;
    if shop.owner_id != Some(owner_id) {
        return Err(LedgerError::not_found("shop", shop_id));
    }
    Ok(shop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_window() {
        let q = PageQuery { page: None, page_size: None };
        assert_eq!(q.window(), (0, 20));
        let q = PageQuery { page: Some(3), page_size: Some(500) };
        assert_eq!(q.window(), (200, 100));
        let q = PageQuery { page: Some(0), page_size: Some(0) };
        assert_eq!(q.window(), (0, 1));
    }
}
