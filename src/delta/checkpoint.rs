//! Delta checkpoints: every ten commits, the live `add` set is flattened
//! into a real Parquet file so a reader can reconstruct table state without
//! replaying the entire `_delta_log` (§4.D', §8 "checkpoint Parquet file").

use crate::delta::actions::Add;
use crate::delta::log::last_checkpoint_path;
use crate::error::{DbResult, Error};
use arrow::array::{Array, ArrayRef, BooleanArray, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use std::sync::Arc;

pub const CHECKPOINT_INTERVAL: u64 = 10;

fn checkpoint_schema() -> Arc<ArrowSchema> {
    Arc::new(ArrowSchema::new(vec![
        Field::new("path", DataType::Utf8, false),
        Field::new("size", DataType::Int64, false),
        Field::new("modificationTime", DataType::Int64, false),
        Field::new("dataChange", DataType::Boolean, false),
        Field::new("stats", DataType::Utf8, true),
    ]))
}

pub fn write_checkpoint(adds: &[Add]) -> DbResult<Bytes> {
    let schema = checkpoint_schema();
    let paths: ArrayRef = Arc::new(StringArray::from_iter_values(adds.iter().map(|a| a.path.as_str())));
    let sizes: ArrayRef = Arc::new(Int64Array::from_iter_values(adds.iter().map(|a| a.size)));
    let mtimes: ArrayRef = Arc::new(Int64Array::from_iter_values(adds.iter().map(|a| a.modification_time)));
    let data_change: ArrayRef = Arc::new(BooleanArray::from_iter(adds.iter().map(|a| Some(a.data_change))));
    let stats: ArrayRef = Arc::new(StringArray::from_iter(adds.iter().map(|a| a.stats.as_deref())));

    let batch = RecordBatch::try_new(schema.clone(), vec![paths, sizes, mtimes, data_change, stats])
        .map_err(|e| Error::internal(e.to_string()))?;

    let mut buf = Vec::new();
    {
        let mut writer = ArrowWriter::try_new(&mut buf, schema, None).map_err(|e| Error::internal(e.to_string()))?;
        writer.write(&batch).map_err(|e| Error::internal(e.to_string()))?;
        writer.close().map_err(|e| Error::internal(e.to_string()))?;
    }
    Ok(Bytes::from(buf))
}

pub fn read_checkpoint(bytes: Bytes) -> DbResult<Vec<Add>> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes).map_err(|e| Error::corrupted("<checkpoint>", e.to_string()))?;
    let reader = builder.build().map_err(|e| Error::corrupted("<checkpoint>", e.to_string()))?;

    let mut out = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| Error::corrupted("<checkpoint>", e.to_string()))?;
        let paths = batch.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        let sizes = batch.column(1).as_any().downcast_ref::<Int64Array>().unwrap();
        let mtimes = batch.column(2).as_any().downcast_ref::<Int64Array>().unwrap();
        let data_change = batch.column(3).as_any().downcast_ref::<BooleanArray>().unwrap();
        let stats = batch.column(4).as_any().downcast_ref::<StringArray>().unwrap();
        for i in 0..batch.num_rows() {
            out.push(Add {
                path: paths.value(i).to_string(),
                partition_values: Default::default(),
                size: sizes.value(i),
                modification_time: mtimes.value(i),
                data_change: data_change.value(i),
                stats: if stats.is_null(i) { None } else { Some(stats.value(i).to_string()) },
            });
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LastCheckpoint {
    pub version: u64,
    pub size: u64,
}

pub fn last_checkpoint_key(table_root: &str) -> String {
    last_checkpoint_path(table_root)
}
