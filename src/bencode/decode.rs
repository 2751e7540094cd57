use super::error::BencodeError;
use super::value::Value;
use bytes::Bytes;
use std::collections::BTreeMap;

const MAX_DEPTH: usize = 32;

/// Decodes exactly one value; any bytes left over are an error.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let (value, used) = decode_prefix(data)?;
    if used != data.len() {
        return Err(BencodeError::TrailingData(data.len() - used));
    }
    Ok(value)
}

/// Decodes one value from the front of `data` and returns it together with
/// the number of bytes it occupied.
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut cursor = Cursor { data, pos: 0 };
    let value = cursor.value(0)?;
    Ok((value, cursor.pos))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof(self.pos))
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep(MAX_DEPTH));
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut entries = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key_at = self.pos;
                    if !self.peek()?.is_ascii_digit() {
                        return Err(BencodeError::NonStringKey(key_at));
                    }
                    let key = self.string()?;
                    let value = self.value(depth + 1)?;
                    entries.insert(key, value);
                }
                self.pos += 1;
                Ok(Value::Dict(entries))
            }
            b'0'..=b'9' => self.string().map(Value::Bytes),
            byte => Err(BencodeError::UnexpectedByte {
                byte,
                offset: self.pos,
            }),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        let start = self.pos;
        self.pos += 1;
        let end = self.data[self.pos..]
            .iter()
            .position(|&b| b == b'e')
            .map(|i| self.pos + i)
            .ok_or(BencodeError::UnexpectedEof(self.data.len()))?;

        let digits = &self.data[self.pos..end];
        let canonical = match digits {
            [] | [b'-'] => false,
            [b'-', b'0', ..] => false,
            [b'0', _, ..] => false,
            _ => true,
        };
        if !canonical {
            return Err(BencodeError::InvalidInteger(start));
        }

        let value = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(BencodeError::InvalidInteger(start))?;

        self.pos = end + 1;
        Ok(Value::Integer(value))
    }

    fn string(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;
        let colon = self.data[self.pos..]
            .iter()
            .position(|&b| b == b':')
            .map(|i| self.pos + i)
            .ok_or(BencodeError::UnexpectedEof(self.data.len()))?;

        let len = std::str::from_utf8(&self.data[start..colon])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(BencodeError::InvalidStringLength(start))?;

        let body = colon + 1;
        let end = body
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof(self.data.len()))?;

        self.pos = end;
        Ok(Bytes::copy_from_slice(&self.data[body..end]))
    }
}
