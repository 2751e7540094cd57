use super::error::BencodeError;
use super::value::Value;
use bytes::BufMut;

/// Encodes a value in canonical form (dictionary keys sorted).
///
/// Encoding into memory cannot fail today; the `Result` keeps call sites
/// uniform with [`decode`](super::decode).
pub fn encode(value: &Value) -> Result<Vec<u8>, BencodeError> {
    let mut out = Vec::new();
    write_value(value, &mut out);
    Ok(out)
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            out.put_u8(b'i');
            out.put_slice(i.to_string().as_bytes());
            out.put_u8(b'e');
        }
        Value::Bytes(b) => write_string(b, out),
        Value::List(items) => {
            out.put_u8(b'l');
            for item in items {
                write_value(item, out);
            }
            out.put_u8(b'e');
        }
        Value::Dict(entries) => {
            out.put_u8(b'd');
            for (key, val) in entries {
                write_string(key, out);
                write_value(val, out);
            }
            out.put_u8(b'e');
        }
    }
}

fn write_string(bytes: &[u8], out: &mut Vec<u8>) {
    out.put_slice(bytes.len().to_string().as_bytes());
    out.put_u8(b':');
    out.put_slice(bytes);
}
