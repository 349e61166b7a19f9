//! Sharding Router
//!
//! Maps an owning id to one of [`SHARD_COUNT`] physical partitions.
//! Accounts and journal entries are routed by principal id; orders,
//! shipments, escrows, settlements and wallet income rows by shop id.
//!
//! There is no global secondary index. Cross-shard reads iterate every
//! partition and merge in memory with [`merge_desc`].

/// Number of physical partitions per sharded logical table.
pub const SHARD_COUNT: usize = 10;

/// Upper bound on rows requested from a single shard for a merged page.
pub const MAX_SHARD_PAGE_ROWS: usize = 1000;

/// Sharded logical tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardedTable {
    AccountTransactions,
    Orders,
    ShipmentRecords,
    Escrows,
    Settlements,
    WalletTransactions,
}

impl ShardedTable {
    pub const ALL: [ShardedTable; 6] = [
        ShardedTable::AccountTransactions,
        ShardedTable::Orders,
        ShardedTable::ShipmentRecords,
        ShardedTable::Escrows,
        ShardedTable::Settlements,
        ShardedTable::WalletTransactions,
    ];

    pub fn logical_name(&self) -> &'static str {
        match self {
            ShardedTable::AccountTransactions => "account_transactions",
            ShardedTable::Orders => "orders",
            ShardedTable::ShipmentRecords => "order_shipment_records",
            ShardedTable::Escrows => "order_escrows",
            ShardedTable::Settlements => "order_settlements",
            ShardedTable::WalletTransactions => "shop_wallet_transactions",
        }
    }

    /// Physical table for `id`
    pub fn table_for(&self, id: i64) -> String {
        table_name(self.logical_name(), index(id))
    }

    /// Every physical table, in shard order
    pub fn all_tables(&self) -> Vec<String> {
        (0..SHARD_COUNT)
            .map(|idx| table_name(self.logical_name(), idx))
            .collect()
    }
}

/// Partition index for an id. Negative ids never occur in practice but
/// still map into range.
pub fn index(id: i64) -> usize {
    id.rem_euclid(SHARD_COUNT as i64) as usize
}

pub fn table_name(logical: &str, idx: usize) -> String {
    format!("{}_{}", logical, idx)
}

/// Rows requested from each shard so that slicing `[offset, offset+limit)`
/// out of the merged result is exact up to the cap.
pub fn per_shard_fetch(offset: usize, limit: usize) -> usize {
    offset.saturating_add(limit).min(MAX_SHARD_PAGE_ROWS)
}

/// Merge per-shard result sets by a descending key, then slice one page.
pub fn merge_desc<T, K, F>(shards: Vec<Vec<T>>, key: F, offset: usize, limit: usize) -> Vec<T>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut all: Vec<T> = shards.into_iter().flatten().collect();
    all.sort_by(|a, b| key(b).cmp(&key(a)));
    all.into_iter().skip(offset).take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_is_id_mod_n() {
        assert_eq!(index(0), 0);
        assert_eq!(index(100), 0);
        assert_eq!(index(19906070668), 8);
        assert_eq!(index(-3), SHARD_COUNT - 3);
    }

    #[test]
    fn test_table_for() {
        assert_eq!(ShardedTable::AccountTransactions.table_for(103), "account_transactions_3");
        assert_eq!(ShardedTable::Settlements.table_for(7), "order_settlements_7");
        assert_eq!(ShardedTable::Orders.all_tables().len(), SHARD_COUNT);
    }

    #[test]
    fn test_merge_desc_orders_and_slices() {
        let shards = vec![vec![(5, "a"), (1, "a")], vec![(4, "b"), (3, "b")], vec![(2, "c")]];
        let page = merge_desc(shards, |r| r.0, 1, 3);
        let keys: Vec<i32> = page.iter().map(|r| r.0).collect();
        assert_eq!(keys, vec![4, 3, 2]);
    }

    #[test]
    fn test_per_shard_fetch_is_capped() {
        assert_eq!(per_shard_fetch(20, 20), 40);
        assert_eq!(per_shard_fetch(5000, 20), MAX_SHARD_PAGE_ROWS);
    }
}
