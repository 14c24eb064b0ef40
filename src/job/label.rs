//! Names of snapshots, restores, table aliases and destination transactions.

use rand::Rng;

use crate::cluster::ClusterSpec;

use super::SyncType;

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// `ccrs_{job}_{sync_id}`
pub fn snapshot_prefix(job: &str, sync_id: i64) -> String {
    format!("ccrs_{job}_{sync_id}")
}

/// `ccrp_{job}_{sync_id}`
pub fn partial_snapshot_prefix(job: &str, sync_id: i64) -> String {
    format!("ccrp_{job}_{sync_id}")
}

pub fn with_timestamp(prefix: &str) -> String {
    format!("{prefix}_{}", now_secs())
}

/// Label of the restore of `snapshot`; empty when there is no snapshot.
pub fn restore_label(snapshot: &str) -> String {
    if snapshot.is_empty() {
        return String::new();
    }
    format!("{snapshot}_r_{}", now_secs())
}

/// Temporary name a table is restored under before being swapped in.
pub fn table_alias(table: &str) -> String {
    format!("__ccr_{table}_{}", now_secs())
}

/// Label of the destination transaction replaying `commit_seq`.
pub fn txn_label(sync_type: SyncType, src: &ClusterSpec, dest: &ClusterSpec, commit_seq: i64) -> String {
    let rand: u32 = rand::thread_rng().gen_range(0..65536);
    match sync_type {
        SyncType::DbSync => format!(
            "ccrj-{rand:x}:{sync_type}:{}:{}:{commit_seq}",
            src.db_id, dest.db_id
        ),
        SyncType::TableSync => format!(
            "ccrj-{rand:x}:{sync_type}:{}_{}:{}_{}:{commit_seq}",
            src.db_id, src.table_id, dest.db_id, dest.table_id
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_names() {
        assert_eq!(snapshot_prefix("j", 3), "ccrs_j_3");
        assert_eq!(partial_snapshot_prefix("j", 3), "ccrp_j_3");
        assert!(with_timestamp("ccrs_j_3").starts_with("ccrs_j_3_"));
        assert!(restore_label("").is_empty());
        assert!(restore_label("snap").starts_with("snap_r_"));
        assert!(table_alias("t").starts_with("__ccr_t_"));
    }

    #[test]
    fn txn_labels_carry_ids() {
        let src = ClusterSpec { db_id: 1, table_id: 2, ..ClusterSpec::default() };
        let dest = ClusterSpec { db_id: 3, table_id: 4, ..ClusterSpec::default() };

        let db = txn_label(SyncType::DbSync, &src, &dest, 99);
        assert!(db.starts_with("ccrj-"));
        assert!(db.ends_with(":db_sync:1:3:99"));

        let table = txn_label(SyncType::TableSync, &src, &dest, 99);
        assert!(table.ends_with(":table_sync:1_2:3_4:99"));
    }
}
