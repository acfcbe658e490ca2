use redb::TableDefinition;

/// Documents: document id -> Document (msgpack)
pub const DOCUMENTS: TableDefinition<i64, &[u8]> = TableDefinition::new("document");

/// Version log: (document id, version row id) -> DocumentVersion (msgpack).
/// Row ids come from the allocator, so a range scan yields versions in commit order.
pub const DOCUMENT_VERSIONS: TableDefinition<(i64, i64), &[u8]> =
    TableDefinition::new("document_version");

/// Access records: (user id, document id) -> DocumentAccessRecord (msgpack)
pub const DOCUMENT_ACCESS_RECORDS: TableDefinition<(i64, i64), &[u8]> =
    TableDefinition::new("document_access_record");
