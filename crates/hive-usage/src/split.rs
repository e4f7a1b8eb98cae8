//! Chunk splitting for oversized reports.
//!
//! A report is split by partitioning its operation map into `n` balanced,
//! key-disjoint slices and then routing every operation event to the chunk that
//! owns its key. Both collections are walked exactly once.
//!
//! ```text
//! map: a b c d e f g h i j          (10 entries, n = 4)
//!      └─┬─┘ └─┬─┘ └┬┘ └┬┘
//! chunk   0     1    2   3          sizes 3 3 2 2
//! ```

use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::report::RawReport;

/// Number of map entries assigned to `chunk_index`.
///
/// The first `total % num_of_chunks` chunks get one extra entry, so shares
/// differ by at most one and always sum to `total`.
pub fn calculate_chunk_size(total: usize, num_of_chunks: usize, chunk_index: usize) -> usize {
    if num_of_chunks == 0 {
        return 0;
    }
    let base = total / num_of_chunks;
    let remainder = total % num_of_chunks;
    if chunk_index < remainder {
        base + 1
    } else {
        base
    }
}

/// Split `report` into `num_of_chunks` sub-reports.
///
/// `num_of_chunks` is clamped to `[1, map.len()]` so no chunk ends up with an
/// empty map. Chunk ids are `{parent_id}--chunk-{index}`. Operations whose key
/// is missing from the map are dropped and logged.
pub fn split_report(report: RawReport, num_of_chunks: usize) -> Vec<RawReport> {
    let RawReport {
        id,
        target,
        organization,
        map,
        operations,
        ..
    } = report;

    let map_len = map.len();
    let num_of_chunks = num_of_chunks.clamp(1, map_len.max(1));

    let mut chunks: Vec<RawReport> = (0..num_of_chunks)
        .map(|index| RawReport {
            id: format!("{}--chunk-{}", id, index),
            target: target.clone(),
            organization: organization.clone(),
            map: BTreeMap::new(),
            operations: Vec::new(),
            size: 0,
        })
        .collect();

    let mut key_to_chunk: HashMap<String, usize> = HashMap::with_capacity(map_len);
    let mut entries = map.into_iter();
    for (chunk_index, chunk) in chunks.iter_mut().enumerate() {
        let chunk_size = calculate_chunk_size(map_len, num_of_chunks, chunk_index);
        for (key, record) in entries.by_ref().take(chunk_size) {
            key_to_chunk.insert(key.clone(), chunk_index);
            chunk.map.insert(key, record);
        }
    }

    let mut dangling = 0usize;
    for operation in operations {
        match key_to_chunk.get(&operation.operation_map_key) {
            Some(&chunk_index) => {
                let chunk = &mut chunks[chunk_index];
                chunk.operations.push(operation);
                chunk.size += 1;
            }
            None => dangling += 1,
        }
    }

    if dangling > 0 {
        warn!(
            report_id = %id,
            dangling,
            "Dropped operations referencing keys missing from the operation map"
        );
    }

    chunks
}
