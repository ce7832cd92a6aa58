// Copyright (c) 2025 ADBC Drivers Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Decoded chunk data and the row cursor that walks it.
//!
//! A [`DecodedBatchSet`] owns every Arrow buffer decoded for one chunk. The
//! buffers are dropped together by [`DecodedBatchSet::release`], exactly once.

use crate::error::{Error, Result};
use arrow_array::{Array, ArrayRef, RecordBatch};
use arrow_schema::{DataType, SchemaRef};

/// Ordered record batches decoded from one chunk.
#[derive(Debug)]
pub struct DecodedBatchSet {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    memory_size: usize,
    released: bool,
}

impl DecodedBatchSet {
    pub fn new(schema: SchemaRef) -> Self {
        Self {
            schema,
            batches: Vec::new(),
            memory_size: 0,
            released: false,
        }
    }

    /// Take ownership of a decoded batch. Batches must match the set's schema.
    pub fn push(&mut self, batch: RecordBatch) -> Result<()> {
        if self.released {
            return Err(Error::state("cannot add batches to a released chunk"));
        }
        if batch.schema().fields() != self.schema.fields() {
            return Err(Error::decode(format!(
                "record batch schema does not match stream schema ({} vs {} columns)",
                batch.num_columns(),
                self.schema.fields().len()
            )));
        }
        self.memory_size += batch.get_array_memory_size();
        self.batches.push(batch);
        Ok(())
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    /// Bytes held by the decoded Arrow buffers.
    pub fn memory_size(&self) -> usize {
        self.memory_size
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Free every buffer in the set. Returns `true` on the first call and
    /// `false` (doing nothing) afterwards.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.batches.clear();
        self.batches.shrink_to_fit();
        self.memory_size = 0;
        self.released = true;
        true
    }
}

/// Raw value of one cell as decoded from the wire. Conversion into caller
/// types is left to the caller.
#[derive(Debug, Clone, Copy)]
pub struct RawValue<'a> {
    array: &'a ArrayRef,
    row: usize,
}

impl<'a> RawValue<'a> {
    /// The column vector holding this value.
    pub fn array(&self) -> &'a ArrayRef {
        self.array
    }

    /// Position of this value inside [`RawValue::array`].
    pub fn row(&self) -> usize {
        self.row
    }

    pub fn data_type(&self) -> &'a DataType {
        self.array.data_type()
    }

    pub fn is_null(&self) -> bool {
        self.array.is_null(self.row)
    }

    /// A one-element array holding just this value.
    pub fn to_array(&self) -> ArrayRef {
        self.array.slice(self.row, 1)
    }
}

/// Position `(batch_index, row_in_batch)` inside a [`DecodedBatchSet`].
///
/// Starts before the first row. Advances monotonically and skips batches
/// with no rows.
#[derive(Debug, Clone, Default)]
pub struct BatchRowCursor {
    batch_index: usize,
    row_in_batch: usize,
    positioned: bool,
}

impl BatchRowCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_index(&self) -> usize {
        self.batch_index
    }

    pub fn row_in_batch(&self) -> usize {
        self.row_in_batch
    }

    /// Whether the cursor currently points at a row.
    pub fn is_positioned(&self) -> bool {
        self.positioned
    }

    pub fn has_next_row(&self, set: &DecodedBatchSet) -> bool {
        self.peek_next(set).is_some()
    }

    /// Advance to the next row. Returns `false` once the set is exhausted.
    pub fn next_row(&mut self, set: &DecodedBatchSet) -> bool {
        match self.peek_next(set) {
            Some((batch_index, row_in_batch)) => {
                self.batch_index = batch_index;
                self.row_in_batch = row_in_batch;
                self.positioned = true;
                true
            }
            None => {
                self.batch_index = set.batches().len();
                self.row_in_batch = 0;
                self.positioned = false;
                false
            }
        }
    }

    pub fn column_value<'a>(
        &self,
        set: &'a DecodedBatchSet,
        column_index: usize,
    ) -> Result<RawValue<'a>> {
        if !self.positioned {
            return Err(Error::state("cursor is not positioned on a row"));
        }
        let batch = set
            .batches()
            .get(self.batch_index)
            .ok_or_else(|| Error::state("cursor points past the decoded batches"))?;
        if column_index >= batch.num_columns() {
            return Err(Error::state(format!(
                "column index {} out of range ({} columns)",
                column_index,
                batch.num_columns()
            )));
        }
        Ok(RawValue {
            array: batch.column(column_index),
            row: self.row_in_batch,
        })
    }

    fn peek_next(&self, set: &DecodedBatchSet) -> Option<(usize, usize)> {
        let batches = set.batches();
        let (mut batch_index, mut row) = if self.positioned {
            (self.batch_index, self.row_in_batch + 1)
        } else {
            (self.batch_index, 0)
        };

        while batch_index < batches.len() {
            if row < batches[batch_index].num_rows() {
                return Some((batch_index, row));
            }
            batch_index += 1;
            row = 0;
        }
        None
    }
}
