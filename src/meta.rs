//! # Metadata Snapshot
//!
//! Point-in-time view of one cluster's catalog for a set of tables: the
//! table → partition → index → tablet → replica tree, the backends, and the
//! ids dropped since the view was taken. Built by a single bulk fetch and
//! never refreshed; callers build a new one after structural changes.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::cluster::ClusterSpec;
use crate::error::{Result, SyncError};
use crate::rpc::{Backend, FeRpc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaMeta {
    pub id: i64,
    pub tablet_id: i64,
    pub backend_id: i64,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabletMeta {
    pub id: i64,
    /// Replicas ordered by id.
    pub replicas: BTreeMap<i64, ReplicaMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMeta {
    pub id: i64,
    pub name: String,
    /// The base index carries the table's own name.
    pub is_base_index: bool,
    /// Tablets ordered by id.
    pub tablets: BTreeMap<i64, TabletMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMeta {
    pub id: i64,
    pub name: String,
    pub range: String,
    pub visible_version: i64,
    pub indexes: HashMap<i64, IndexMeta>,
    index_names: HashMap<String, i64>,
}

impl PartitionMeta {
    pub fn index_by_name(&self, name: &str) -> Option<&IndexMeta> {
        self.index_names.get(name).and_then(|id| self.indexes.get(id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub id: i64,
    pub name: String,
    pub base_index_id: i64,
    pub partitions: HashMap<i64, PartitionMeta>,
    partition_ranges: HashMap<String, i64>,
}

impl TableMeta {
    pub fn partition_by_range(&self, range: &str) -> Option<&PartitionMeta> {
        self.partition_ranges.get(range).and_then(|id| self.partitions.get(id))
    }
}

/// Catalog view of one cluster for a fixed set of tables.
#[derive(Debug, Clone)]
pub struct MetaSnapshot {
    db_id: i64,
    tables: HashMap<i64, TableMeta>,
    table_names: HashMap<String, i64>,
    backends: BTreeMap<i64, Backend>,
    host_mapping: Option<HashMap<String, String>>,
    dropped_partitions: HashSet<i64>,
    dropped_tables: HashSet<i64>,
    dropped_indexes: HashSet<i64>,
}

impl MetaSnapshot {
    /// Fetch the backends and the catalog tree of `table_ids` from the frontend.
    pub async fn fetch(fe: &dyn FeRpc, spec: &ClusterSpec, table_ids: &[i64]) -> Result<Self> {
        let backend_resp = fe.get_backends(spec).await?;
        if !backend_resp.status.is_ok() {
            return Err(SyncError::meta(format!(
                "get backend meta failed, status: {}",
                backend_resp.status
            )));
        }
        let Some(backend_list) = backend_resp.backends else {
            return Err(SyncError::meta("get backend meta failed, backend meta not set"));
        };
        let backends = backend_list
            .into_iter()
            .map(|backend| (backend.id, backend))
            .collect::<BTreeMap<_, _>>();

        let table_resp = fe.get_table_meta(spec, table_ids).await?;
        if !table_resp.status.is_ok() {
            return Err(SyncError::meta(format!(
                "get table meta failed, status: {}",
                table_resp.status
            )));
        }
        let Some(db_meta) = table_resp.db_meta else {
            return Err(SyncError::meta("get table meta failed, db meta not set"));
        };

        let mut tables = HashMap::new();
        let mut table_names = HashMap::new();
        for table in db_meta.tables {
            let mut table_meta = TableMeta {
                id: table.id,
                name: table.name,
                base_index_id: 0,
                partitions: HashMap::new(),
                partition_ranges: HashMap::new(),
            };

            for partition in table.partitions {
                let mut partition_meta = PartitionMeta {
                    id: partition.id,
                    name: partition.name,
                    range: partition.range,
                    visible_version: partition.visible_version,
                    indexes: HashMap::new(),
                    index_names: HashMap::new(),
                };

                for index in partition.indexes {
                    let is_base_index = index.name == table_meta.name;
                    if is_base_index {
                        table_meta.base_index_id = index.id;
                    }
                    let tablets = index
                        .tablets
                        .into_iter()
                        .map(|tablet| {
                            let replicas = tablet
                                .replicas
                                .into_iter()
                                .map(|replica| {
                                    let meta = ReplicaMeta {
                                        id: replica.id,
                                        tablet_id: tablet.id,
                                        backend_id: replica.backend_id,
                                        version: replica.version,
                                    };
                                    (meta.id, meta)
                                })
                                .collect();
                            (tablet.id, TabletMeta { id: tablet.id, replicas })
                        })
                        .collect();

                    partition_meta.index_names.insert(index.name.clone(), index.id);
                    partition_meta.indexes.insert(
                        index.id,
                        IndexMeta {
                            id: index.id,
                            name: index.name,
                            is_base_index,
                            tablets,
                        },
                    );
                }

                table_meta
                    .partition_ranges
                    .insert(partition_meta.range.clone(), partition_meta.id);
                table_meta.partitions.insert(partition_meta.id, partition_meta);
            }

            table_names.insert(table_meta.name.clone(), table_meta.id);
            tables.insert(table_meta.id, table_meta);
        }

        debug!(
            db_id = db_meta.id,
            tables = tables.len(),
            backends = backends.len(),
            "Built metadata snapshot"
        );

        Ok(Self {
            db_id: db_meta.id,
            tables,
            table_names,
            backends,
            host_mapping: spec.host_mapping.clone(),
            dropped_partitions: db_meta.dropped_partitions.into_iter().collect(),
            dropped_tables: db_meta.dropped_tables.into_iter().collect(),
            dropped_indexes: db_meta.dropped_indexes.into_iter().collect(),
        })
    }

    pub fn db_id(&self) -> i64 {
        self.db_id
    }

    fn table(&self, table_id: i64) -> Result<&TableMeta> {
        self.tables.get(&table_id).ok_or_else(|| {
            SyncError::meta(format!("dbId: {}, tableId: {table_id} not found", self.db_id))
        })
    }

    fn partition(&self, table_id: i64, partition_id: i64) -> Result<(&TableMeta, &PartitionMeta)> {
        let table = self.table(table_id)?;
        let partition = table.partitions.get(&partition_id).ok_or_else(|| {
            SyncError::meta(format!(
                "dbId: {}, tableId: {table_id}, partitionId: {partition_id} not found",
                self.db_id
            ))
        })?;
        Ok((table, partition))
    }

    pub fn get_table_id(&self, name: &str) -> Option<i64> {
        self.table_names.get(name).copied()
    }

    pub fn get_table_name(&self, table_id: i64) -> Option<&str> {
        self.tables.get(&table_id).map(|table| table.name.as_str())
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.tables.values()
    }

    /// Tablets of one index, ordered by tablet id.
    pub fn get_tablets(
        &self,
        table_id: i64,
        partition_id: i64,
        index_id: i64,
    ) -> Result<&BTreeMap<i64, TabletMeta>> {
        let (_, partition) = self.partition(table_id, partition_id)?;
        let index = partition.indexes.get(&index_id).ok_or_else(|| {
            SyncError::meta(format!(
                "dbId: {}, tableId: {table_id}, partitionId: {partition_id}, indexId: {index_id} not found",
                self.db_id
            ))
        })?;
        Ok(&index.tablets)
    }

    pub fn get_partition_id_by_range(&self, table_id: i64, range: &str) -> Result<i64> {
        let table = self.table(table_id)?;
        table.partition_by_range(range).map(|p| p.id).ok_or_else(|| {
            SyncError::meta(format!(
                "dbId: {}, tableId: {table_id}, partitionRange: {range} not found",
                self.db_id
            ))
        })
    }

    /// Range key to partition id.
    pub fn get_partition_range_map(&self, table_id: i64) -> Result<&HashMap<String, i64>> {
        Ok(&self.table(table_id)?.partition_ranges)
    }

    pub fn get_index_id_map(
        &self,
        table_id: i64,
        partition_id: i64,
    ) -> Result<&HashMap<i64, IndexMeta>> {
        let (_, partition) = self.partition(table_id, partition_id)?;
        Ok(&partition.indexes)
    }

    /// Index name to index, plus the base index of the partition.
    pub fn get_index_name_map(
        &self,
        table_id: i64,
        partition_id: i64,
    ) -> Result<(HashMap<&str, &IndexMeta>, &IndexMeta)> {
        let (table, partition) = self.partition(table_id, partition_id)?;
        let base = partition.index_by_name(&table.name).ok_or_else(|| {
            SyncError::meta(format!(
                "dbId: {}, tableId: {table_id}, partitionId: {partition_id}, indexName: {} not found",
                self.db_id, table.name
            ))
        })?;
        let by_name = partition
            .indexes
            .values()
            .map(|index| (index.name.as_str(), index))
            .collect();
        Ok((by_name, base))
    }

    /// Backends by id, with private hosts replaced by their public mapping.
    pub fn get_backend_map(&self) -> Result<BTreeMap<i64, Backend>> {
        let Some(mapping) = self.host_mapping.as_ref().filter(|m| !m.is_empty()) else {
            return Ok(self.backends.clone());
        };

        self.backends
            .iter()
            .map(|(id, backend)| {
                let host = mapping.get(&backend.host).ok_or_else(|| {
                    SyncError::normal(format!(
                        "the public ip of host {} is not found, consider adding it via update_host_mapping",
                        backend.host
                    ))
                })?;
                let mut backend = backend.clone();
                backend.host = host.clone();
                Ok((*id, backend))
            })
            .collect()
    }

    pub fn is_table_dropped(&self, table_id: i64) -> bool {
        self.dropped_tables.contains(&table_id)
    }

    pub fn is_partition_dropped(&self, partition_id: i64) -> bool {
        self.dropped_partitions.contains(&partition_id)
    }

    pub fn is_index_dropped(&self, index_id: i64) -> bool {
        self.dropped_indexes.contains(&index_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{
        BackendsResponse, BeginTxnResponse, DbMetaInfo, GetBinlogResponse, IndexMetaInfo,
        PartitionMetaInfo, ReplicaMetaInfo, RestoreSnapshotRequest, SnapshotResult, Status,
        StatusCode, SubTxnInfo, TableMetaInfo, TableMetaResponse, TabletCommitInfo,
        TabletMetaInfo,
    };
    use async_trait::async_trait;

    struct CatalogFe {
        backends: Option<Vec<Backend>>,
        meta_status: Status,
    }

    #[async_trait]
    impl FeRpc for CatalogFe {
        async fn get_binlog(&self, _: &ClusterSpec, _: i64) -> Result<GetBinlogResponse> {
            unimplemented!()
        }
        async fn begin_transaction(&self, _: &ClusterSpec, _: &str, _: &[i64]) -> Result<BeginTxnResponse> {
            unimplemented!()
        }
        async fn begin_transaction_for_txn_insert(
            &self,
            _: &ClusterSpec,
            _: &str,
            _: &[i64],
            _: i64,
        ) -> Result<BeginTxnResponse> {
            unimplemented!()
        }
        async fn commit_transaction(&self, _: &ClusterSpec, _: i64, _: &[TabletCommitInfo]) -> Result<Status> {
            unimplemented!()
        }
        async fn commit_transaction_for_txn_insert(
            &self,
            _: &ClusterSpec,
            _: i64,
            _: &[SubTxnInfo],
        ) -> Result<Status> {
            unimplemented!()
        }
        async fn rollback_transaction(&self, _: &ClusterSpec, _: i64) -> Result<Status> {
            unimplemented!()
        }
        async fn get_snapshot(&self, _: &ClusterSpec, _: &str, _: bool) -> Result<SnapshotResult> {
            unimplemented!()
        }
        async fn restore_snapshot(&self, _: &ClusterSpec, _: &RestoreSnapshotRequest) -> Result<Status> {
            unimplemented!()
        }
        async fn get_backends(&self, _: &ClusterSpec) -> Result<BackendsResponse> {
            Ok(BackendsResponse {
                status: Status::ok(),
                backends: self.backends.clone(),
            })
        }
        async fn get_table_meta(&self, _: &ClusterSpec, _: &[i64]) -> Result<TableMetaResponse> {
            let tablet = |id: i64| TabletMetaInfo {
                id,
                replicas: vec![ReplicaMetaInfo { id: id * 10, backend_id: 1, version: 5 }],
            };
            Ok(TableMetaResponse {
                status: self.meta_status.clone(),
                db_meta: Some(DbMetaInfo {
                    id: 100,
                    tables: vec![TableMetaInfo {
                        id: 1,
                        name: "orders".into(),
                        partitions: vec![PartitionMetaInfo {
                            id: 11,
                            name: "p1".into(),
                            range: "[0, 10)".into(),
                            visible_version: 5,
                            indexes: vec![
                                IndexMetaInfo { id: 21, name: "orders".into(), tablets: vec![tablet(33), tablet(31)] },
                                IndexMetaInfo { id: 22, name: "r1".into(), tablets: vec![tablet(41)] },
                            ],
                        }],
                    }],
                    dropped_partitions: vec![12],
                    dropped_tables: vec![2],
                    dropped_indexes: vec![23],
                }),
            })
        }
    }

    fn backend(id: i64, host: &str) -> Backend {
        Backend { id, host: host.into(), be_port: 9060, http_port: 8040, brpc_port: 8060 }
    }

    fn fe() -> CatalogFe {
        CatalogFe { backends: Some(vec![backend(1, "10.0.0.1")]), meta_status: Status::ok() }
    }

    #[tokio::test]
    async fn builds_catalog_tree() {
        let meta = MetaSnapshot::fetch(&fe(), &ClusterSpec::default(), &[1]).await.unwrap();

        assert_eq!(meta.db_id(), 100);
        assert_eq!(meta.get_partition_id_by_range(1, "[0, 10)").unwrap(), 11);
        let tablets = meta.get_tablets(1, 11, 21).unwrap();
        assert_eq!(tablets.keys().copied().collect::<Vec<_>>(), vec![31, 33]);

        let (by_name, base) = meta.get_index_name_map(1, 11).unwrap();
        assert_eq!(base.id, 21);
        assert!(base.is_base_index);
        assert!(!by_name["r1"].is_base_index);

        assert!(meta.is_table_dropped(2));
        assert!(meta.is_partition_dropped(12));
        assert!(meta.is_index_dropped(23));
        assert!(!meta.is_table_dropped(1));
    }

    #[tokio::test]
    async fn missing_lookups_are_meta_errors() {
        let meta = MetaSnapshot::fetch(&fe(), &ClusterSpec::default(), &[1]).await.unwrap();
        assert!(meta.get_tablets(1, 11, 99).unwrap_err().is_meta());
        assert!(meta.get_partition_id_by_range(9, "x").unwrap_err().is_meta());
        assert!(meta.get_index_id_map(1, 99).unwrap_err().is_meta());
    }

    #[tokio::test]
    async fn failed_fetch_is_meta_error() {
        let fe = CatalogFe {
            backends: Some(vec![]),
            meta_status: Status::error(StatusCode::Other(1), "boom"),
        };
        let err = MetaSnapshot::fetch(&fe, &ClusterSpec::default(), &[1]).await.unwrap_err();
        assert!(err.is_meta());

        let fe = CatalogFe { backends: None, meta_status: Status::ok() };
        let err = MetaSnapshot::fetch(&fe, &ClusterSpec::default(), &[1]).await.unwrap_err();
        assert!(err.is_meta());
    }

    #[tokio::test]
    async fn backend_hosts_follow_mapping() {
        let mut spec = ClusterSpec::default();
        spec.host_mapping = Some(HashMap::from([("10.0.0.1".to_string(), "1.2.3.4".to_string())]));
        let meta = MetaSnapshot::fetch(&fe(), &spec, &[1]).await.unwrap();
        assert_eq!(meta.get_backend_map().unwrap()[&1].host, "1.2.3.4");

        spec.host_mapping = Some(HashMap::from([("10.9.9.9".to_string(), "1.2.3.4".to_string())]));
        let meta = MetaSnapshot::fetch(&fe(), &spec, &[1]).await.unwrap();
        let err = meta.get_backend_map().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Normal);

        let meta = MetaSnapshot::fetch(&fe(), &ClusterSpec::default(), &[1]).await.unwrap();
        assert_eq!(meta.get_backend_map().unwrap()[&1].host, "10.0.0.1");
    }
}
