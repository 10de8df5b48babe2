use crate::data::dataset::Dataset;
use crate::data::index::{IndexBuilder, UNKNOWN_INDEX};
use crate::data::info::{DatasetInfo, FeatureColumn, SideFeatureTable, DATASET_INFO_VERSION};
use crate::data::reader::RawTable;
use crate::data::schema::{ColumnRoles, FeatureSide, ResolvedColumns};
use crate::error::{Result, SchemaError};
use crate::models::EncodedRecord;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// One row's fields, validated but not yet indexed.
struct ParsedRow<'a> {
    user: &'a str,
    item: &'a str,
    label: f32,
    sparse: Vec<&'a str>,
    dense: Vec<f32>,
}

fn field<'a>(row: &'a [String], position: usize, row_no: usize, header: &[String]) -> std::result::Result<&'a str, SchemaError> {
    row.get(position).map(|s| s.as_str()).ok_or_else(|| SchemaError::MissingField {
        row: row_no,
        column: column_label(header, position),
    })
}

fn number(value: &str, position: usize, row_no: usize, header: &[String]) -> std::result::Result<f32, SchemaError> {
    match value.parse::<f32>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(SchemaError::InvalidNumber {
            row: row_no,
            column: column_label(header, position),
            value: value.to_string(),
        }),
    }
}

fn column_label(header: &[String], position: usize) -> String {
    header
        .get(position)
        .cloned()
        .unwrap_or_else(|| format!("#{}", position))
}

fn parse_row<'a>(
    row: &'a [String],
    row_no: usize,
    columns: &ResolvedColumns,
    header: &[String],
) -> std::result::Result<ParsedRow<'a>, SchemaError> {
    let user = field(row, columns.user, row_no, header)?;
    let item = field(row, columns.item, row_no, header)?;
    let label_raw = field(row, columns.label, row_no, header)?;
    let label = number(label_raw, columns.label, row_no, header)?;

    let sparse = columns
        .sparse
        .iter()
        .map(|&pos| field(row, pos, row_no, header))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let dense = columns
        .dense
        .iter()
        .map(|&pos| field(row, pos, row_no, header).and_then(|v| number(v, pos, row_no, header)))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(ParsedRow {
        user,
        item,
        label,
        sparse,
        dense,
    })
}

fn parse_table<'a>(table: &'a RawTable, roles: &ColumnRoles) -> Result<Vec<ParsedRow<'a>>> {
    let columns = roles.resolve(&table.header)?;
    let parsed = table
        .rows
        .iter()
        .enumerate()
        .map(|(row_no, row)| parse_row(row, row_no, &columns, &table.header))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(parsed)
}

fn slots(columns: &[FeatureColumn], side: FeatureSide) -> Vec<usize> {
    columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.side == side)
        .map(|(slot, _)| slot)
        .collect()
}

/// Builds the frozen encoding state from training rows.
///
/// Every row is validated before any index is created, so a schema error
/// leaves nothing half-built behind.
pub fn build_info(table: &RawTable, roles: &ColumnRoles) -> Result<DatasetInfo> {
    let parsed = parse_table(table, roles)?;

    let mut users = IndexBuilder::new();
    let mut items = IndexBuilder::new();
    let mut categories: Vec<IndexBuilder> = roles.sparse.iter().map(|_| IndexBuilder::new()).collect();
    let mut encoded = Vec::with_capacity(parsed.len());

    for row in &parsed {
        let user = users.insert(row.user);
        let item = items.insert(row.item);
        let codes: Vec<u32> = row
            .sparse
            .iter()
            .zip(categories.iter_mut())
            .map(|(value, builder)| builder.insert(value))
            .collect();
        encoded.push((user, item, codes));
    }

    let user_index = users.freeze();
    let item_index = items.freeze();
    let sparse_indexes: Vec<_> = categories.into_iter().map(IndexBuilder::freeze).collect();

    let sparse_columns: Vec<FeatureColumn> = roles
        .sparse
        .iter()
        .map(|c| FeatureColumn {
            column: c.clone(),
            side: roles.side_of(c),
        })
        .collect();
    let dense_columns: Vec<FeatureColumn> = roles
        .dense
        .iter()
        .map(|c| FeatureColumn {
            column: c.clone(),
            side: roles.side_of(c),
        })
        .collect();

    let mut user_features = SideFeatureTable::new(
        slots(&sparse_columns, FeatureSide::User),
        slots(&dense_columns, FeatureSide::User),
        user_index.table_size(),
    );
    let mut item_features = SideFeatureTable::new(
        slots(&sparse_columns, FeatureSide::Item),
        slots(&dense_columns, FeatureSide::Item),
        item_index.table_size(),
    );

    let mut user_filled = vec![false; user_index.table_size()];
    let mut item_filled = vec![false; item_index.table_size()];
    let mut pairs = HashSet::with_capacity(encoded.len());
    for ((user, item, codes), row) in encoded.iter().zip(parsed.iter()) {
        pairs.insert((*user, *item));
        if !user_filled[*user as usize] {
            user_features.fill(*user, codes, &row.dense);
            user_filled[*user as usize] = true;
        }
        if !item_filled[*item as usize] {
            item_features.fill(*item, codes, &row.dense);
            item_filled[*item as usize] = true;
        }
    }

    let info = DatasetInfo {
        format_version: DATASET_INFO_VERSION,
        roles: roles.clone(),
        user_index,
        item_index,
        sparse_indexes,
        sparse_columns,
        dense_columns,
        n_train_records: parsed.len(),
        n_interactions: pairs.len(),
        user_features,
        item_features,
    };

    info!(
        "Built dataset info: {} users, {} items, {} records, sparsity {:.6}",
        info.n_users(),
        info.n_items(),
        info.n_train_records(),
        info.sparsity()
    );
    Ok(info)
}

/// Encodes rows against a frozen `DatasetInfo`; unseen values map to the sentinel.
pub fn encode(table: &RawTable, info: &Arc<DatasetInfo>) -> Result<Dataset> {
    let parsed = parse_table(table, &info.roles)?;

    let records: Vec<EncodedRecord> = parsed
        .into_iter()
        .map(|row| encode_parsed(row, info))
        .collect();

    let unknown = records
        .iter()
        .filter(|r| r.user_index == UNKNOWN_INDEX || r.item_index == UNKNOWN_INDEX)
        .count();
    debug!(
        "Encoded {} records ({} with unknown user or item)",
        records.len(),
        unknown
    );

    Ok(Dataset::new(records, Arc::clone(info)))
}

fn encode_parsed(row: ParsedRow<'_>, info: &DatasetInfo) -> EncodedRecord {
    let sparse_codes = row
        .sparse
        .iter()
        .zip(info.sparse_indexes.iter())
        .map(|(value, index)| index.encode(value))
        .collect();

    EncodedRecord {
        user_index: info.user_index.encode(row.user),
        item_index: info.item_index.encode(row.item),
        label: row.label,
        sparse_codes,
        dense_values: row.dense,
        is_negative: false,
    }
}

/// Builds the info from the training rows and encodes them in one go.
pub fn build_and_encode(table: &RawTable, roles: &ColumnRoles) -> Result<(Arc<DatasetInfo>, Dataset)> {
    let info = Arc::new(build_info(table, roles)?);
    let dataset = encode(table, &info)?;
    Ok((info, dataset))
}
