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

//! Macros that fold one Arrow column into a buffer of running row hashes.
//! Null slots leave the running hash untouched.

macro_rules! downcast_column {
    ($column: expr, $array_type: ident) => {
        $column
            .as_any()
            .downcast_ref::<$array_type>()
            .ok_or_else(|| {
                datafusion::common::DataFusionError::Internal(format!(
                    "Failed to downcast column to {}. Actual data type: {:?}.",
                    stringify!($array_type),
                    $column.data_type()
                ))
            })
    };
}

/// Hashes a primitive column after converting each value to `$ty`, the width
/// Spark hashes it with.
macro_rules! hash_array_primitive {
    ($array_type: ident, $column: ident, $ty: ty, $hashes: ident, $hash_method: ident) => {{
        let array = downcast_column!($column, $array_type)?;
        let values = array.values();
        if array.null_count() == 0 {
            // Fast path: no nulls, use direct iteration
            for (hash, value) in $hashes.iter_mut().zip(values.iter()) {
                *hash = $hash_method((*value as $ty).to_le_bytes(), *hash);
            }
        } else {
            for (i, (hash, value)) in $hashes.iter_mut().zip(values.iter()).enumerate() {
                if !array.is_null(i) {
                    *hash = $hash_method((*value as $ty).to_le_bytes(), *hash);
                }
            }
        }
    }};
}

/// Floats hash their bit pattern; -0.0 is hashed as 0.0 so that both compare
/// equal under the join.
macro_rules! hash_array_float {
    ($array_type: ident, $column: ident, $ty: ty, $hashes: ident, $hash_method: ident) => {{
        let array = downcast_column!($column, $array_type)?;
        for (i, (hash, value)) in $hashes.iter_mut().zip(array.values().iter()).enumerate() {
            if array.is_null(i) {
                continue;
            }
            let bits: $ty = if *value == 0.0 {
                0
            } else {
                value.to_bits() as $ty
            };
            *hash = $hash_method(bits.to_le_bytes(), *hash);
        }
    }};
}

macro_rules! hash_array_bytes {
    ($array_type: ident, $column: ident, $hashes: ident, $hash_method: ident) => {{
        let array = downcast_column!($column, $array_type)?;
        for (i, hash) in $hashes.iter_mut().enumerate() {
            if !array.is_null(i) {
                *hash = $hash_method(array.value(i), *hash);
            }
        }
    }};
}

macro_rules! hash_array_boolean {
    ($column: ident, $hashes: ident, $hash_method: ident) => {{
        let array = downcast_column!($column, BooleanArray)?;
        for (i, hash) in $hashes.iter_mut().enumerate() {
            if !array.is_null(i) {
                *hash = $hash_method(i32::from(array.value(i)).to_le_bytes(), *hash);
            }
        }
    }};
}
