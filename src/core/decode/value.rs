use crate::core::error::{Error, ErrorKind};
use arrow::array::{Array, AsArray};
use arrow::datatypes::{
    DataType, Field, Float32Type, Float64Type, Int8Type, Int16Type, Int32Type, Int64Type,
    TimeUnit, TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType, UInt8Type, UInt16Type, UInt32Type, UInt64Type,
};
use arrow::util::display::array_value_to_string;
use serde_json::{Map, Number, Value};
use std::net::Ipv6Addr;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

const EXTENSION_NAME_KEY: &str = "ARROW:extension:name";

/// Renders one Arrow cell as JSON.
///
/// Engine extension types (addresses, subnets) render as their text form;
/// timestamps render as RFC 3339; anything without a native JSON shape falls
/// back to Arrow's display formatting.
pub fn cell_value(field: &Field, array: &dyn Array, row: usize) -> Result<Value, Error> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }
    let special = match extension_name(field) {
        Some("tenzir.ip" | "vast.address") => ip_text(array, row),
        Some("tenzir.subnet" | "vast.subnet") => subnet_text(array, row),
        _ => None,
    };
    if let Some(text) = special {
        return Ok(Value::String(text));
    }

    let value = match array.data_type() {
        DataType::Boolean => Value::Bool(array.as_boolean().value(row)),
        DataType::Int8 => Value::from(array.as_primitive::<Int8Type>().value(row)),
        DataType::Int16 => Value::from(array.as_primitive::<Int16Type>().value(row)),
        DataType::Int32 => Value::from(array.as_primitive::<Int32Type>().value(row)),
        DataType::Int64 => Value::from(array.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => Value::from(array.as_primitive::<UInt8Type>().value(row)),
        DataType::UInt16 => Value::from(array.as_primitive::<UInt16Type>().value(row)),
        DataType::UInt32 => Value::from(array.as_primitive::<UInt32Type>().value(row)),
        DataType::UInt64 => Value::from(array.as_primitive::<UInt64Type>().value(row)),
        DataType::Float32 => float(f64::from(array.as_primitive::<Float32Type>().value(row))),
        DataType::Float64 => float(array.as_primitive::<Float64Type>().value(row)),
        DataType::Utf8 => Value::String(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => Value::String(array.as_string::<i64>().value(row).to_string()),
        DataType::Binary => Value::String(hex(array.as_binary::<i32>().value(row))),
        DataType::LargeBinary => Value::String(hex(array.as_binary::<i64>().value(row))),
        DataType::FixedSizeBinary(_) => {
            Value::String(hex(array.as_fixed_size_binary().value(row)))
        }
        DataType::Timestamp(unit, _) => match timestamp_text(array, *unit, row) {
            Some(text) => Value::String(text),
            None => display(array, row)?,
        },
        DataType::List(item) => {
            let values = array.as_list::<i32>().value(row);
            list_value(item, values.as_ref())?
        }
        DataType::LargeList(item) => {
            let values = array.as_list::<i64>().value(row);
            list_value(item, values.as_ref())?
        }
        DataType::Struct(fields) => {
            let array = array.as_struct();
            let mut object = Map::with_capacity(fields.len());
            for (field, column) in fields.iter().zip(array.columns()) {
                object.insert(field.name().clone(), cell_value(field, column.as_ref(), row)?);
            }
            Value::Object(object)
        }
        _ => display(array, row)?,
    };
    Ok(value)
}

fn extension_name(field: &Field) -> Option<&str> {
    field.metadata().get(EXTENSION_NAME_KEY).map(String::as_str)
}

fn list_value(item: &Field, values: &dyn Array) -> Result<Value, Error> {
    (0..values.len())
        .map(|index| cell_value(item, values, index))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

fn display(array: &dyn Array, row: usize) -> Result<Value, Error> {
    array_value_to_string(array, row)
        .map(Value::String)
        .map_err(|err| {
            Error::new(ErrorKind::Protocol)
                .with_message(format!("unrenderable {} value", array.data_type()))
                .with_source(err)
        })
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Addresses are 16 bytes; IPv4 is stored IPv4-mapped.
fn ip_text(array: &dyn Array, row: usize) -> Option<String> {
    let bytes: [u8; 16] = match array.data_type() {
        DataType::FixedSizeBinary(16) => array.as_fixed_size_binary().value(row).try_into().ok()?,
        _ => return None,
    };
    let addr = Ipv6Addr::from(bytes);
    Some(match addr.to_ipv4_mapped() {
        Some(v4) => v4.to_string(),
        None => addr.to_string(),
    })
}

fn subnet_text(array: &dyn Array, row: usize) -> Option<String> {
    let DataType::Struct(fields) = array.data_type() else {
        return None;
    };
    let array = array.as_struct();
    let address = fields.iter().position(|field| field.name() == "address")?;
    let length = fields.iter().position(|field| field.name() == "length")?;

    let address_column = array.column(address);
    let bytes: [u8; 16] = match address_column.data_type() {
        DataType::FixedSizeBinary(16) => address_column
            .as_fixed_size_binary()
            .value(row)
            .try_into()
            .ok()?,
        _ => return None,
    };
    let length = array
        .column(length)
        .as_primitive_opt::<UInt8Type>()?
        .value(row);

    let addr = Ipv6Addr::from(bytes);
    Some(match addr.to_ipv4_mapped() {
        Some(v4) if length >= 96 => format!("{v4}/{}", length - 96),
        _ => format!("{addr}/{length}"),
    })
}

fn timestamp_text(array: &dyn Array, unit: TimeUnit, row: usize) -> Option<String> {
    let nanos = match unit {
        TimeUnit::Second => {
            i128::from(array.as_primitive::<TimestampSecondType>().value(row)) * 1_000_000_000
        }
        TimeUnit::Millisecond => {
            i128::from(array.as_primitive::<TimestampMillisecondType>().value(row)) * 1_000_000
        }
        TimeUnit::Microsecond => {
            i128::from(array.as_primitive::<TimestampMicrosecondType>().value(row)) * 1_000
        }
        TimeUnit::Nanosecond => {
            i128::from(array.as_primitive::<TimestampNanosecondType>().value(row))
        }
    };
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .ok()?
        .format(&Rfc3339)
        .ok()
}
