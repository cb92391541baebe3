// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Append-only, page based container for build rows in Arrow row format.
//!
//! A stream starts pinned: all of its pages live in memory, each one charged
//! against the stream's memory reservation. Unpinning writes the pages to an
//! Arrow IPC spill file and from then on every page is written out as soon
//! as it fills, so the spilled pages are always a prefix of the stream.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::sync::Arc;

use arrow::array::{AsArray, BinaryArray, RecordBatch};
use arrow::buffer::{Buffer, OffsetBuffer, ScalarBuffer};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::{IpcWriteOptions, StreamWriter};
use arrow::ipc::CompressionType;
use arrow::row::RowConverter;
use datafusion::common::{DataFusionError, Result as DFResult};
use datafusion::execution::disk_manager::RefCountedTempFile;
use datafusion::execution::memory_pool::{MemoryConsumer, MemoryReservation};
use datafusion::execution::runtime_env::RuntimeEnv;
use log::debug;

/// I/O buffer size for spill file reads and writes.
const SPILL_IO_BUFFER_SIZE: usize = 1024 * 1024;

/// A run of encoded rows. `offsets` has one more entry than there are rows.
#[derive(Debug)]
struct Page {
    data: Vec<u8>,
    offsets: Vec<i32>,
    capacity: usize,
}

impl Page {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            offsets: vec![0],
            capacity,
        }
    }

    fn num_rows(&self) -> usize {
        self.offsets.len() - 1
    }

    fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    fn push(&mut self, row: &[u8]) {
        self.data.extend_from_slice(row);
        self.offsets.push(self.data.len() as i32);
    }

    fn row(&self, i: usize) -> &[u8] {
        &self.data[self.offsets[i] as usize..self.offsets[i + 1] as usize]
    }

    fn into_batch(self, schema: &SchemaRef) -> DFResult<RecordBatch> {
        let offsets = OffsetBuffer::new(ScalarBuffer::from(self.offsets));
        let values = BinaryArray::try_new(offsets, Buffer::from_vec(self.data), None)?;
        Ok(RecordBatch::try_new(Arc::clone(schema), vec![Arc::new(values)])?)
    }

    fn from_batch(batch: &RecordBatch) -> DFResult<Self> {
        let values = batch.column(0).as_binary_opt::<i32>().ok_or_else(|| {
            DataFusionError::Internal("Spilled row page is not a binary column".to_string())
        })?;
        let value_offsets = values.value_offsets();
        let start = value_offsets[0];
        let end = value_offsets[value_offsets.len() - 1];
        let data = values.value_data()[start as usize..end as usize].to_vec();
        let capacity = data.len();
        Ok(Self {
            data,
            offsets: value_offsets.iter().map(|o| o - start).collect(),
            capacity,
        })
    }
}

fn page_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("rows", DataType::Binary, false)]))
}

/// Incremental writer of pages to an Arrow IPC spill file.
struct SpillWriter {
    writer: StreamWriter<BufWriter<File>>,
    temp_file: RefCountedTempFile,
}

impl SpillWriter {
    fn new(temp_file: RefCountedTempFile, schema: &SchemaRef) -> DFResult<Self> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp_file.path())
            .map_err(|e| DataFusionError::Execution(format!("Failed to open spill file: {e}")))?;
        let buf_writer = BufWriter::with_capacity(SPILL_IO_BUFFER_SIZE, file);
        let write_options =
            IpcWriteOptions::default().try_with_compression(Some(CompressionType::LZ4_FRAME))?;
        let writer = StreamWriter::try_new_with_options(buf_writer, schema, write_options)?;
        Ok(Self {
            writer,
            temp_file,
        })
    }

    fn write_page(&mut self, page: Page, schema: &SchemaRef) -> DFResult<()> {
        self.writer.write(&page.into_batch(schema)?)?;
        Ok(())
    }

    /// Must be called before reading back.
    fn finish(mut self) -> DFResult<RefCountedTempFile> {
        self.writer.finish()?;
        Ok(self.temp_file)
    }
}

fn open_spill_file(spill_file: &RefCountedTempFile) -> DFResult<StreamReader<BufReader<File>>> {
    let file = File::open(spill_file.path())
        .map_err(|e| DataFusionError::Execution(format!("Failed to open spill file: {e}")))?;
    let reader = BufReader::with_capacity(SPILL_IO_BUFFER_SIZE, file);
    Ok(StreamReader::try_new(reader, None)?)
}

/// Row container of one build partition.
pub struct SpillableRowStream {
    name: String,
    schema: SchemaRef,
    page_schema: SchemaRef,
    converter: Arc<RowConverter>,
    runtime: Arc<RuntimeEnv>,
    page_size: usize,
    max_page_size: usize,
    /// In-memory pages, following the spilled prefix.
    pages: VecDeque<Page>,
    spill_writer: Option<SpillWriter>,
    pinned: bool,
    num_rows: usize,
    /// Encoded bytes of all rows, in memory or spilled.
    byte_size: usize,
    bytes_spilled: usize,
    reservation: MemoryReservation,
}

impl std::fmt::Debug for SpillableRowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillableRowStream")
            .field("name", &self.name)
            .field("num_rows", &self.num_rows)
            .field("pinned", &self.pinned)
            .field("pages_in_memory", &self.pages.len())
            .field("bytes_spilled", &self.bytes_spilled)
            .finish()
    }
}

impl SpillableRowStream {
    /// `schema` describes the rows `converter` encodes; pages decode back to
    /// batches of that schema.
    pub fn new(
        name: impl Into<String>,
        schema: SchemaRef,
        converter: Arc<RowConverter>,
        runtime: &Arc<RuntimeEnv>,
        page_size: usize,
        max_page_size: usize,
    ) -> Self {
        let name = name.into();
        let reservation = MemoryConsumer::new(name.clone())
            .with_can_spill(true)
            .register(&runtime.memory_pool);
        Self {
            name,
            schema,
            page_schema: page_schema(),
            converter,
            runtime: Arc::clone(runtime),
            page_size,
            max_page_size,
            pages: VecDeque::new(),
            spill_writer: None,
            pinned: true,
            num_rows: 0,
            byte_size: 0,
            bytes_spilled: 0,
            reservation,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Memory currently reserved for in-memory pages.
    pub fn bytes_in_memory(&self) -> usize {
        self.reservation.size()
    }

    pub fn bytes_spilled(&self) -> usize {
        self.bytes_spilled
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn is_spilled(&self) -> bool {
        self.spill_writer.is_some()
    }

    /// Fast path: copies `row` into the current write page if it has room.
    #[inline]
    pub fn add_row(&mut self, row: &[u8]) -> bool {
        match self.pages.back_mut() {
            Some(page) if page.remaining() >= row.len() => {
                page.push(row);
                self.num_rows += 1;
                self.byte_size += row.len();
                true
            }
            _ => false,
        }
    }

    /// Slow path: starts a new write page for `row`, first writing out the
    /// full one when the stream is unpinned. Returns `Ok(false)` when the
    /// memory pool refuses the new page; the caller has to free memory and
    /// retry.
    pub fn add_row_slow(&mut self, row: &[u8]) -> DFResult<bool> {
        if row.len() > self.max_page_size {
            return Err(DataFusionError::ResourcesExhausted(format!(
                "Row of {} bytes exceeds the maximum page size of {} bytes in {}",
                row.len(),
                self.max_page_size,
                self.name
            )));
        }
        if !self.pinned {
            self.spill_in_memory_pages()?;
        }
        let capacity = self.page_size.max(row.len());
        if self.reservation.try_grow(capacity).is_err() {
            return Ok(false);
        }
        let mut page = Page::with_capacity(capacity);
        page.push(row);
        self.pages.push_back(page);
        self.num_rows += 1;
        self.byte_size += row.len();
        Ok(true)
    }

    /// Writes every in-memory page to the spill file and releases their
    /// memory. Subsequent appends are written out page by page.
    pub fn unpin_stream(&mut self) -> DFResult<()> {
        self.pinned = false;
        self.spill_in_memory_pages()
    }

    fn spill_in_memory_pages(&mut self) -> DFResult<()> {
        if self.pages.is_empty() {
            return Ok(());
        }
        if self.spill_writer.is_none() {
            let temp_file = self
                .runtime
                .disk_manager
                .create_tmp_file("hash join build partition")?;
            self.spill_writer = Some(SpillWriter::new(temp_file, &self.page_schema)?);
        }
        let Some(writer) = self.spill_writer.as_mut() else {
            return Err(DataFusionError::Internal(format!(
                "Missing spill writer for {}",
                self.name
            )));
        };
        let mut written = 0;
        while let Some(page) = self.pages.pop_front() {
            let page_bytes = page.data.len();
            let page_capacity = page.capacity;
            writer.write_page(page, &self.page_schema)?;
            self.reservation.shrink(page_capacity);
            written += page_bytes;
        }
        self.bytes_spilled += written;
        debug!("{}: spilled {} bytes", self.name, written);
        Ok(())
    }

    /// Brings spilled pages back into memory. Returns `Ok(false)` and leaves
    /// the stream unpinned when the memory pool cannot hold them.
    pub fn pin_stream(&mut self) -> DFResult<bool> {
        if self.pinned {
            return Ok(true);
        }
        if self.spill_writer.is_none() {
            self.pinned = true;
            return Ok(true);
        }
        if self.reservation.try_grow(self.bytes_spilled).is_err() {
            return Ok(false);
        }
        let mut read_back = VecDeque::new();
        if let Some(writer) = self.spill_writer.take() {
            let spill_file = writer.finish()?;
            for batch in open_spill_file(&spill_file)? {
                read_back.push_back(Page::from_batch(&batch?)?);
            }
        }
        read_back.append(&mut self.pages);
        self.pages = read_back;
        self.bytes_spilled = 0;
        self.pinned = true;
        Ok(true)
    }

    fn decode_page(&self, page: &Page) -> DFResult<RecordBatch> {
        let parser = self.converter.parser();
        let rows = (0..page.num_rows()).map(|i| parser.parse(page.row(i)));
        let columns = self.converter.convert_rows(rows)?;
        Ok(RecordBatch::try_new(Arc::clone(&self.schema), columns)?)
    }

    /// Decodes all rows of a pinned stream, in append order.
    pub fn read_pinned(&self) -> DFResult<Vec<RecordBatch>> {
        if !self.pinned || self.spill_writer.is_some() {
            return Err(DataFusionError::Internal(format!(
                "Cannot read {} in memory while it is spilled",
                self.name
            )));
        }
        self.pages
            .iter()
            .filter(|page| page.num_rows() > 0)
            .map(|page| self.decode_page(page))
            .collect()
    }

    /// Consumes the stream into a reader over all of its rows in the order
    /// they were appended, spilled pages first.
    pub fn into_reader(mut self) -> DFResult<RowStreamReader> {
        let spilled = match self.spill_writer.take() {
            Some(writer) => {
                let spill_file = writer.finish()?;
                let reader = open_spill_file(&spill_file)?;
                Some((reader, spill_file))
            }
            None => None,
        };
        Ok(RowStreamReader {
            spilled,
            stream: self,
        })
    }

    /// Drops all pages and the spill file and releases the reservation.
    pub fn close(mut self) {
        self.pages.clear();
        self.spill_writer = None;
        self.reservation.free();
    }
}

/// Sequential reader over a consumed [`SpillableRowStream`]. Memory of
/// in-memory pages is released as they are decoded.
pub struct RowStreamReader {
    spilled: Option<(StreamReader<BufReader<File>>, RefCountedTempFile)>,
    stream: SpillableRowStream,
}

impl RowStreamReader {
    pub fn schema(&self) -> &SchemaRef {
        &self.stream.schema
    }

    pub fn num_rows(&self) -> usize {
        self.stream.num_rows
    }

    fn next_spilled(&mut self) -> Option<DFResult<RecordBatch>> {
        let (reader, _) = self.spilled.as_mut()?;
        match reader.next() {
            Some(Ok(batch)) => Some(
                Page::from_batch(&batch).and_then(|page| self.stream.decode_page(&page)),
            ),
            Some(Err(e)) => Some(Err(e.into())),
            None => {
                self.spilled = None;
                None
            }
        }
    }
}

impl Iterator for RowStreamReader {
    type Item = DFResult<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(result) = self.next_spilled() {
                return Some(result);
            }
            let page = self.stream.pages.pop_front()?;
            let capacity = page.capacity;
            let result = self.stream.decode_page(&page);
            drop(page);
            self.stream.reservation.shrink(capacity);
            if page_is_empty(&result) {
                continue;
            }
            return Some(result);
        }
    }
}

fn page_is_empty(result: &DFResult<RecordBatch>) -> bool {
    matches!(result, Ok(batch) if batch.num_rows() == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, Int64Array, StringArray};
    use arrow::compute::concat_batches;
    use arrow::row::SortField;
    use datafusion::execution::memory_pool::GreedyMemoryPool;
    use datafusion::execution::runtime_env::RuntimeEnvBuilder;

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int32, true),
            Field::new("value", DataType::Int64, false),
        ]))
    }

    fn make_batch(start: i32, count: usize) -> RecordBatch {
        let ids: Vec<Option<i32>> = (0..count as i32)
            .map(|i| if (start + i) % 7 == 0 { None } else { Some(start + i) })
            .collect();
        let values: Vec<i64> = (0..count as i64).map(|i| (start as i64 + i) * 10).collect();
        RecordBatch::try_new(
            test_schema(),
            vec![
                Arc::new(Int32Array::from(ids)),
                Arc::new(Int64Array::from(values)),
            ],
        )
        .unwrap()
    }

    fn converter(schema: &SchemaRef) -> Arc<RowConverter> {
        let fields = schema
            .fields()
            .iter()
            .map(|f| SortField::new(f.data_type().clone()))
            .collect();
        Arc::new(RowConverter::new(fields).unwrap())
    }

    fn runtime_with_limit(limit: usize) -> Arc<RuntimeEnv> {
        RuntimeEnvBuilder::new()
            .with_memory_pool(Arc::new(GreedyMemoryPool::new(limit)))
            .build_arc()
            .unwrap()
    }

    fn new_stream(runtime: &Arc<RuntimeEnv>, page_size: usize) -> SpillableRowStream {
        let schema = test_schema();
        let converter = converter(&schema);
        SpillableRowStream::new("test stream", schema, converter, runtime, page_size, 1024)
    }

    fn append_batch(stream: &mut SpillableRowStream, batch: &RecordBatch) -> DFResult<()> {
        let rows = stream.converter.convert_columns(batch.columns())?;
        for row in rows.iter() {
            if !stream.add_row(row.as_ref()) {
                assert!(stream.add_row_slow(row.as_ref())?);
            }
        }
        Ok(())
    }

    fn read_all(stream: SpillableRowStream) -> DFResult<RecordBatch> {
        let schema = Arc::clone(stream.schema());
        let batches = stream.into_reader()?.collect::<DFResult<Vec<_>>>()?;
        Ok(concat_batches(&schema, &batches)?)
    }

    #[test]
    fn test_in_memory_round_trip() -> DFResult<()> {
        let runtime = runtime_with_limit(1 << 20);
        let mut stream = new_stream(&runtime, 256);
        let batch = make_batch(0, 100);
        append_batch(&mut stream, &batch)?;
        assert_eq!(stream.num_rows(), 100);
        assert_eq!(stream.byte_size(), 100 * 14);
        // 18 rows of 14 bytes per page
        assert_eq!(stream.bytes_in_memory(), 6 * 256);

        let pinned = concat_batches(stream.schema(), &stream.read_pinned()?)?;
        assert_eq!(pinned, batch);
        assert_eq!(read_all(stream)?, batch);
        assert_eq!(runtime.memory_pool.reserved(), 0);
        Ok(())
    }

    #[test]
    fn test_spill_round_trip_preserves_order() -> DFResult<()> {
        let runtime = runtime_with_limit(1 << 20);
        let mut stream = new_stream(&runtime, 256);
        let first = make_batch(0, 50);
        let second = make_batch(50, 70);
        append_batch(&mut stream, &first)?;
        stream.unpin_stream()?;
        assert!(stream.is_spilled());
        assert_eq!(stream.bytes_in_memory(), 0);
        assert_eq!(stream.bytes_spilled(), 50 * 14);

        // appends after unpinning keep at most one page in memory
        append_batch(&mut stream, &second)?;
        assert!(stream.bytes_in_memory() <= 256);
        assert_eq!(stream.num_rows(), 120);

        let expected = concat_batches(&test_schema(), &[first, second])?;
        assert_eq!(read_all(stream)?, expected);
        assert_eq!(runtime.memory_pool.reserved(), 0);
        Ok(())
    }

    #[test]
    fn test_pin_after_spill() -> DFResult<()> {
        let runtime = runtime_with_limit(1 << 20);
        let mut stream = new_stream(&runtime, 128);
        let batch = make_batch(0, 40);
        append_batch(&mut stream, &batch)?;
        stream.unpin_stream()?;
        assert!(stream.read_pinned().is_err());

        assert!(stream.pin_stream()?);
        assert!(!stream.is_spilled());
        assert_eq!(stream.bytes_in_memory(), 40 * 14);
        let pinned = concat_batches(stream.schema(), &stream.read_pinned()?)?;
        assert_eq!(pinned, batch);

        // rows appended after pinning follow the read-back pages
        let more = make_batch(40, 5);
        append_batch(&mut stream, &more)?;
        let expected = concat_batches(&test_schema(), &[batch, more])?;
        assert_eq!(read_all(stream)?, expected);
        Ok(())
    }

    #[test]
    fn test_pin_fails_without_memory() -> DFResult<()> {
        let runtime = runtime_with_limit(1024);
        let mut stream = new_stream(&runtime, 256);
        append_batch(&mut stream, &make_batch(0, 36))?;
        stream.unpin_stream()?;
        append_batch(&mut stream, &make_batch(36, 36))?;

        // hold the rest of the pool so the spilled bytes cannot come back
        let mut other = MemoryConsumer::new("other").register(&runtime.memory_pool);
        other.try_grow(1024 - stream.bytes_in_memory())?;
        assert!(!stream.pin_stream()?);
        assert!(!stream.is_pinned());
        drop(other);

        assert_eq!(read_all(stream)?.num_rows(), 72);
        Ok(())
    }

    #[test]
    fn test_slow_path_reports_missing_memory() -> DFResult<()> {
        let runtime = runtime_with_limit(300);
        let mut stream = new_stream(&runtime, 256);
        let batch = make_batch(0, 40);
        let rows = stream.converter.convert_columns(batch.columns())?;
        let mut refused = false;
        for row in rows.iter() {
            if !stream.add_row(row.as_ref()) && !stream.add_row_slow(row.as_ref())? {
                refused = true;
                break;
            }
        }
        assert!(refused);
        // the rows that made it in are intact
        assert_eq!(stream.num_rows(), 18);
        Ok(())
    }

    #[test]
    fn test_oversized_rows() -> DFResult<()> {
        let schema = Arc::new(Schema::new(vec![Field::new("s", DataType::Utf8, false)]));
        let runtime = runtime_with_limit(1 << 20);
        let mut stream = SpillableRowStream::new(
            "strings",
            Arc::clone(&schema),
            converter(&schema),
            &runtime,
            64,
            512,
        );
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![Arc::new(StringArray::from(vec!["x".repeat(200), "y".repeat(2000)]))],
        )?;
        let rows = stream.converter.convert_columns(batch.columns())?;

        // larger than a page but within the maximum: gets its own page
        assert!(!stream.add_row(rows.row(0).as_ref()));
        assert!(stream.add_row_slow(rows.row(0).as_ref())?);
        assert!(stream.bytes_in_memory() > 64);

        let err = stream.add_row_slow(rows.row(1).as_ref()).unwrap_err();
        assert!(matches!(err, DataFusionError::ResourcesExhausted(_)));
        assert!(err.to_string().contains("strings"));
        Ok(())
    }

    #[test]
    fn test_close_releases_everything() -> DFResult<()> {
        let runtime = runtime_with_limit(1 << 20);
        let mut stream = new_stream(&runtime, 128);
        append_batch(&mut stream, &make_batch(0, 30))?;
        stream.unpin_stream()?;
        append_batch(&mut stream, &make_batch(30, 30))?;
        stream.close();
        assert_eq!(runtime.memory_pool.reserved(), 0);
        Ok(())
    }
}
