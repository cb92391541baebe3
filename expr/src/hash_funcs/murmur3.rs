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

//! Spark compatible Murmur3 x86_32 hashing.

use arrow::array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Date32Array, Date64Array, Decimal128Array,
    FixedSizeBinaryArray, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array,
    Int8Array, LargeBinaryArray, LargeStringArray, StringArray, StringViewArray,
    Time32MillisecondArray, Time32SecondArray, Time64MicrosecondArray, Time64NanosecondArray,
    TimestampMicrosecondArray, TimestampMillisecondArray, TimestampNanosecondArray,
    TimestampSecondArray, UInt16Array, UInt32Array, UInt64Array, UInt8Array,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, TimeUnit};
use datafusion::common::{DataFusionError, Result};

/// Computes the 32-bit Murmur3 hash of `data` the same way Spark's
/// `Murmur3_x86_32.hashUnsafeBytes` does: 4-byte little-endian blocks
/// followed by the tail bytes mixed one at a time as signed values.
pub fn spark_compatible_murmur3_hash<T: AsRef<[u8]>>(data: T, seed: u32) -> u32 {
    #[inline]
    fn mix_k1(mut k1: i32) -> i32 {
        k1 = k1.wrapping_mul(0xcc9e2d51u32 as i32);
        k1 = k1.rotate_left(15);
        k1.wrapping_mul(0x1b873593u32 as i32)
    }

    #[inline]
    fn mix_h1(mut h1: i32, k1: i32) -> i32 {
        h1 ^= k1;
        h1 = h1.rotate_left(13);
        h1.wrapping_mul(5).wrapping_add(0xe6546b64u32 as i32)
    }

    #[inline]
    fn fmix(mut h1: i32, len: i32) -> i32 {
        h1 ^= len;
        h1 ^= ((h1 as u32) >> 16) as i32;
        h1 = h1.wrapping_mul(0x85ebca6bu32 as i32);
        h1 ^= ((h1 as u32) >> 13) as i32;
        h1 = h1.wrapping_mul(0xc2b2ae35u32 as i32);
        h1 ^= ((h1 as u32) >> 16) as i32;
        h1
    }

    let data = data.as_ref();
    let mut h1 = seed as i32;
    let mut blocks = data.chunks_exact(4);
    for block in blocks.by_ref() {
        let half_word = i32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        h1 = mix_h1(h1, mix_k1(half_word));
    }
    for byte in blocks.remainder() {
        h1 = mix_h1(h1, mix_k1(*byte as i8 as i32));
    }
    fmix(h1, data.len() as i32) as u32
}

/// Folds `arrays` into `hashes_buffer`, one column after another. Each entry
/// of `hashes_buffer` must be initialized with the seed (or the running hash
/// of earlier columns) before calling. Null values leave the running hash of
/// their row unchanged.
pub fn create_murmur3_hashes<'a>(
    arrays: &[ArrayRef],
    hashes_buffer: &'a mut [u32],
) -> Result<&'a mut [u32]> {
    for col in arrays {
        if col.len() != hashes_buffer.len() {
            return Err(DataFusionError::Internal(format!(
                "Hash buffer holds {} rows but column has {} rows",
                hashes_buffer.len(),
                col.len()
            )));
        }
        hash_column(col, hashes_buffer)?;
    }
    Ok(hashes_buffer)
}

fn hash_column(col: &ArrayRef, hashes: &mut [u32]) -> Result<()> {
    match col.data_type() {
        DataType::Boolean => hash_array_boolean!(col, hashes, spark_compatible_murmur3_hash),
        DataType::Int8 => {
            hash_array_primitive!(Int8Array, col, i32, hashes, spark_compatible_murmur3_hash)
        }
        DataType::Int16 => {
            hash_array_primitive!(Int16Array, col, i32, hashes, spark_compatible_murmur3_hash)
        }
        DataType::Int32 => {
            hash_array_primitive!(Int32Array, col, i32, hashes, spark_compatible_murmur3_hash)
        }
        DataType::Int64 => {
            hash_array_primitive!(Int64Array, col, i64, hashes, spark_compatible_murmur3_hash)
        }
        DataType::UInt8 => {
            hash_array_primitive!(UInt8Array, col, i32, hashes, spark_compatible_murmur3_hash)
        }
        DataType::UInt16 => {
            hash_array_primitive!(UInt16Array, col, i32, hashes, spark_compatible_murmur3_hash)
        }
        DataType::UInt32 => {
            hash_array_primitive!(UInt32Array, col, i32, hashes, spark_compatible_murmur3_hash)
        }
        DataType::UInt64 => {
            hash_array_primitive!(UInt64Array, col, i64, hashes, spark_compatible_murmur3_hash)
        }
        DataType::Float32 => {
            hash_array_float!(Float32Array, col, i32, hashes, spark_compatible_murmur3_hash)
        }
        DataType::Float64 => {
            hash_array_float!(Float64Array, col, i64, hashes, spark_compatible_murmur3_hash)
        }
        DataType::Date32 => {
            hash_array_primitive!(Date32Array, col, i32, hashes, spark_compatible_murmur3_hash)
        }
        DataType::Date64 => {
            hash_array_primitive!(Date64Array, col, i64, hashes, spark_compatible_murmur3_hash)
        }
        DataType::Time32(TimeUnit::Second) => hash_array_primitive!(
            Time32SecondArray,
            col,
            i32,
            hashes,
            spark_compatible_murmur3_hash
        ),
        DataType::Time32(_) => hash_array_primitive!(
            Time32MillisecondArray,
            col,
            i32,
            hashes,
            spark_compatible_murmur3_hash
        ),
        DataType::Time64(TimeUnit::Microsecond) => hash_array_primitive!(
            Time64MicrosecondArray,
            col,
            i64,
            hashes,
            spark_compatible_murmur3_hash
        ),
        DataType::Time64(_) => hash_array_primitive!(
            Time64NanosecondArray,
            col,
            i64,
            hashes,
            spark_compatible_murmur3_hash
        ),
        DataType::Timestamp(TimeUnit::Second, _) => hash_array_primitive!(
            TimestampSecondArray,
            col,
            i64,
            hashes,
            spark_compatible_murmur3_hash
        ),
        DataType::Timestamp(TimeUnit::Millisecond, _) => hash_array_primitive!(
            TimestampMillisecondArray,
            col,
            i64,
            hashes,
            spark_compatible_murmur3_hash
        ),
        DataType::Timestamp(TimeUnit::Microsecond, _) => hash_array_primitive!(
            TimestampMicrosecondArray,
            col,
            i64,
            hashes,
            spark_compatible_murmur3_hash
        ),
        DataType::Timestamp(TimeUnit::Nanosecond, _) => hash_array_primitive!(
            TimestampNanosecondArray,
            col,
            i64,
            hashes,
            spark_compatible_murmur3_hash
        ),
        DataType::Utf8 => {
            hash_array_bytes!(StringArray, col, hashes, spark_compatible_murmur3_hash)
        }
        DataType::LargeUtf8 => {
            hash_array_bytes!(LargeStringArray, col, hashes, spark_compatible_murmur3_hash)
        }
        DataType::Utf8View => {
            hash_array_bytes!(StringViewArray, col, hashes, spark_compatible_murmur3_hash)
        }
        DataType::Binary => {
            hash_array_bytes!(BinaryArray, col, hashes, spark_compatible_murmur3_hash)
        }
        DataType::LargeBinary => {
            hash_array_bytes!(LargeBinaryArray, col, hashes, spark_compatible_murmur3_hash)
        }
        DataType::FixedSizeBinary(_) => {
            hash_array_bytes!(FixedSizeBinaryArray, col, hashes, spark_compatible_murmur3_hash)
        }
        DataType::Decimal128(precision, _) => {
            let array = downcast_column!(col, Decimal128Array)?;
            let compact = *precision <= 18;
            for (i, hash) in hashes.iter_mut().enumerate() {
                if array.is_null(i) {
                    continue;
                }
                let value = array.value(i);
                *hash = if compact {
                    spark_compatible_murmur3_hash((value as i64).to_le_bytes(), *hash)
                } else {
                    spark_compatible_murmur3_hash(value.to_be_bytes(), *hash)
                };
            }
        }
        DataType::Dictionary(_, value_type) => {
            let unpacked = cast(col, value_type)?;
            hash_column(&unpacked, hashes)?;
        }
        other => {
            return Err(DataFusionError::NotImplemented(format!(
                "Unsupported data type in hasher: {other}"
            )));
        }
    }
    Ok(())
}
