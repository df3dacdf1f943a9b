use std::collections::BTreeMap;

#[derive(PartialEq, Debug, Clone)]
pub enum Bencode {
    BNumber(i64),
    BString(Vec<u8>),
    BList(Vec<Bencode>),
    BDict(BTreeMap<Vec<u8>, Bencode>),
}

#[derive(PartialEq, Debug)]
pub enum BencodeError {
    InvalidBencode,
    InvalidBencodeType,
    InvalidBencodeNumber,
    InvalidBencodeString,
    InvalidBencodeList,
    InvalidBencodeDict,
    UnexpectedEndOfBuffer,
}

pub trait ToBencode {
    fn to_bencode(&self) -> Bencode;
}

impl ToBencode for String {
    fn to_bencode(&self) -> Bencode {
        Bencode::BString(self.as_bytes().to_vec())
    }
}

impl ToBencode for &str {
    fn to_bencode(&self) -> Bencode {
        Bencode::BString(self.as_bytes().to_vec())
    }
}

impl ToBencode for i64 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber(*self)
    }
}

impl ToBencode for u64 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber((*self) as i64)
    }
}

impl ToBencode for u32 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber((*self).into())
    }
}

impl ToBencode for u16 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber((*self).into())
    }
}

impl ToBencode for i32 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber((*self).into())
    }
}

impl ToBencode for Vec<u8> {
    fn to_bencode(&self) -> Bencode {
        Bencode::BString(self.clone())
    }
}

impl ToBencode for BTreeMap<Vec<u8>, Bencode> {
    fn to_bencode(&self) -> Bencode {
        Bencode::BDict(self.clone())
    }
}

impl<T: ToBencode> ToBencode for Vec<T> {
    fn to_bencode(&self) -> Bencode {
        Bencode::BList(self.iter().map(|s| s.to_bencode()).collect())
    }
}

impl ToBencode for Bencode {
    fn to_bencode(&self) -> Bencode {
        self.clone()
    }
}

impl Bencode {
    /// Parses a bencoded vec of bytes into a Bencode enum.
    ///
    /// # Example
    ///
    /// ```rust
    /// use bencoder::bencode::Bencode;
    ///
    /// // String
    /// let data = b"5:hello";
    /// let bencode = Bencode::decode(&data.to_vec()).unwrap();
    ///
    /// assert_eq!(bencode, Bencode::BString(b"hello".to_vec()));
    ///
    /// // Integer
    /// let data = b"i123e";
    /// let bencode = Bencode::decode(&data.to_vec()).unwrap();
    ///
    /// assert_eq!(bencode, Bencode::BNumber(123));
    /// ```
    pub fn decode(data: &[u8]) -> Result<Bencode, BencodeError> {
        let (bencode, _) = Bencode::do_decode(data)?;
        Ok(bencode)
    }

    /// Parses the leading bencoded value of a buffer and returns it together
    /// with the number of bytes consumed.
    ///
    /// Wire protocols append raw payloads after a bencoded header, so callers
    /// need to know where the value ended.
    pub fn decode_prefix(data: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        Bencode::do_decode(data)
    }

    fn do_decode(data: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        if data.is_empty() {
            return Err(BencodeError::InvalidBencode);
        };
        match data[0] {
            b'i' => Bencode::decode_number(data),
            b'l' => Bencode::decode_list(data),
            b'd' => Bencode::decode_dict(data),
            b'0'..=b'9' => Bencode::decode_string(data),
            _ => Err(BencodeError::InvalidBencode),
        }
    }

    fn decode_string(data: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        let mut i = 0;
        while data[i] != b':' {
            i += 1;
            if i >= data.len() {
                return Err(BencodeError::UnexpectedEndOfBuffer);
            }
        }
        let length = &data[0..i];
        let length = match String::from_utf8(length.to_vec()) {
            Ok(s) => s,
            Err(_) => return Err(BencodeError::InvalidBencodeString),
        };
        let length = match length.parse::<usize>() {
            Ok(n) => n,
            Err(_) => return Err(BencodeError::InvalidBencodeString),
        };
        let start = i + 1;
        if start + length > data.len() {
            return Err(BencodeError::UnexpectedEndOfBuffer);
        }
        let string = data[start..start + length].to_vec();
        Ok((Bencode::BString(string), start + length))
    }

    fn decode_number(data: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        let mut i = 1;
        loop {
            if i >= data.len() {
                return Err(BencodeError::UnexpectedEndOfBuffer);
            }
            if data[i] == b'e' {
                break;
            }
            i += 1;
        }
        let number = &data[1..i];
        let number = match String::from_utf8(number.to_vec()) {
            Ok(s) => s,
            Err(_) => return Err(BencodeError::InvalidBencodeNumber),
        };
        let number = match number.parse::<i64>() {
            Ok(n) => n,
            Err(_) => return Err(BencodeError::InvalidBencodeNumber),
        };
        Ok((Bencode::BNumber(number), i + 1))
    }

    fn decode_list(data: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        let mut i = 1;
        let mut list = Vec::new();
        loop {
            if i >= data.len() {
                return Err(BencodeError::UnexpectedEndOfBuffer);
            }
            if data[i] == b'e' {
                break;
            }
            let (value, size) = Bencode::do_decode(&data[i..])?;
            list.push(value);
            i += size;
        }
        Ok((Bencode::BList(list), i + 1))
    }

    fn decode_dict(data: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        let mut i = 1;
        let mut dict = BTreeMap::new();
        loop {
            if i >= data.len() {
                return Err(BencodeError::UnexpectedEndOfBuffer);
            }
            if data[i] == b'e' {
                break;
            }
            let (key, size) = Bencode::do_decode(&data[i..])?;
            i += size;
            let (value, size) = Bencode::do_decode(&data[i..])?;
            i += size;
            match key {
                Bencode::BString(key) => dict.insert(key, value),
                _ => return Err(BencodeError::InvalidBencodeDict),
            };
        }
        Ok((Bencode::BDict(dict), i + 1))
    }

    /// Encodes a Bencode enum into a bencoded vec of bytes.
    ///
    /// # Example
    ///
    /// ```rust
    /// use bencoder::bencode::Bencode;
    ///
    /// // String
    /// let data = String::from("spam");
    /// let encoded = Bencode::encode(&data);
    ///
    /// assert_eq!(encoded, b"4:spam");
    ///
    /// // Integer
    /// let data = 123;
    /// let encoded = Bencode::encode(&data);
    ///
    /// assert_eq!(encoded, b"i123e");
    /// ```
    pub fn encode(bencode: &dyn ToBencode) -> Vec<u8> {
        let bencode = bencode.to_bencode();
        Bencode::do_encode(bencode)
    }

    fn do_encode(bencode: Bencode) -> Vec<u8> {
        match bencode {
            Bencode::BNumber(n) => Bencode::encode_number(n),
            Bencode::BString(s) => Bencode::encode_string(s),
            Bencode::BList(l) => Bencode::encode_list(l),
            Bencode::BDict(d) => Bencode::encode_dict(d),
        }
    }

    fn encode_number(n: i64) -> Vec<u8> {
        let mut encoded = vec![b'i'];
        encoded.extend(n.to_string().into_bytes());
        encoded.push(b'e');
        encoded
    }

    fn encode_string(s: Vec<u8>) -> Vec<u8> {
        let mut encoded = Vec::new();
        encoded.extend(s.len().to_string().into_bytes());
        encoded.push(b':');
        encoded.extend(s);
        encoded
    }

    fn encode_list(l: Vec<Bencode>) -> Vec<u8> {
        let mut encoded = vec![b'l'];
        for bencode in l {
            encoded.extend(Bencode::do_encode(bencode));
        }
        encoded.push(b'e');
        encoded
    }

    fn encode_dict(d: BTreeMap<Vec<u8>, Bencode>) -> Vec<u8> {
        let mut encoded = vec![b'd'];
        for (key, value) in d {
            encoded.extend(Bencode::do_encode(Bencode::BString(key)));
            encoded.extend(Bencode::do_encode(value));
        }
        encoded.push(b'e');
        encoded
    }

    /// Looks up a key in a BDict, returning `None` for missing keys or
    /// non-dict receivers.
    pub fn dict_get(&self, key: &[u8]) -> Option<&Bencode> {
        match self {
            Bencode::BDict(d) => d.get(key),
            _ => None,
        }
    }

    /// Returns the value as a number, if it is one.
    pub fn as_number(&self) -> Option<i64> {
        match self {
            Bencode::BNumber(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the value as a byte string, if it is one.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Bencode::BString(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as a list, if it is one.
    pub fn as_list(&self) -> Option<&[Bencode]> {
        match self {
            Bencode::BList(l) => Some(l),
            _ => None,
        }
    }

    /// Returns the value as a dict, if it is one.
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Bencode>> {
        match self {
            Bencode::BDict(d) => Some(d),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_empty_data() {
        let data: &[u8; 0] = &[];
        assert_eq!(Bencode::decode(data), Err(BencodeError::InvalidBencode));
    }

    #[test]
    fn test_decode_string() {
        let data = b"5:hello";
        let bencode = Bencode::decode(&data.to_vec()).unwrap();
        assert_eq!(bencode, Bencode::BString(b"hello".to_vec()));
    }

    #[test]
    fn test_decode_number() {
        let data = b"i123e";
        let bencode = Bencode::decode(&data.to_vec()).unwrap();
        assert_eq!(bencode, Bencode::BNumber(123));
    }

    #[test]
    fn test_decode_negative_number() {
        let data = b"i-42e";
        let bencode = Bencode::decode(&data.to_vec()).unwrap();
        assert_eq!(bencode, Bencode::BNumber(-42));
    }

    #[test]
    fn test_decode_list() {
        let data = b"l5:helloi123ee";
        let bencode = Bencode::decode(&data.to_vec()).unwrap();
        assert_eq!(
            bencode,
            Bencode::BList(vec![
                Bencode::BString(b"hello".to_vec()),
                Bencode::BNumber(123)
            ])
        );
    }

    #[test]
    fn test_decode_dict() {
        let data = b"d3:cow3:moo4:spam4:eggse";
        let bencode = Bencode::decode(&data.to_vec()).unwrap();

        let mut expected = BTreeMap::new();
        expected.insert(b"cow".to_vec(), Bencode::BString(b"moo".to_vec()));
        expected.insert(b"spam".to_vec(), Bencode::BString(b"eggs".to_vec()));

        assert_eq!(bencode, Bencode::BDict(expected));
    }

    #[test]
    fn test_decode_truncated_string() {
        let data = b"10:short";
        assert_eq!(
            Bencode::decode(&data.to_vec()),
            Err(BencodeError::UnexpectedEndOfBuffer)
        );
    }

    #[test]
    fn test_decode_truncated_number() {
        let data = b"i123";
        assert_eq!(
            Bencode::decode(&data.to_vec()),
            Err(BencodeError::UnexpectedEndOfBuffer)
        );
    }

    #[test]
    fn test_decode_unterminated_dict() {
        let data = b"d3:cow3:moo";
        assert_eq!(
            Bencode::decode(&data.to_vec()),
            Err(BencodeError::UnexpectedEndOfBuffer)
        );
    }

    #[test]
    fn test_decode_prefix_returns_consumed_length() {
        let mut data = b"d1:ai1ee".to_vec();
        data.extend(b"raw trailing payload");

        let (bencode, consumed) = Bencode::decode_prefix(&data).unwrap();

        let mut expected = BTreeMap::new();
        expected.insert(b"a".to_vec(), Bencode::BNumber(1));
        assert_eq!(bencode, Bencode::BDict(expected));
        assert_eq!(consumed, 8);
        assert_eq!(&data[consumed..], b"raw trailing payload");
    }

    #[test]
    fn test_encode_string() {
        let data = String::from("spam");
        assert_eq!(Bencode::encode(&data), b"4:spam");
    }

    #[test]
    fn test_encode_number() {
        let data = 123;
        assert_eq!(Bencode::encode(&data), b"i123e");
    }

    #[test]
    fn test_encode_dict_sorts_keys() {
        let mut dict = BTreeMap::new();
        dict.insert(b"spam".to_vec(), Bencode::BString(b"eggs".to_vec()));
        dict.insert(b"cow".to_vec(), Bencode::BString(b"moo".to_vec()));

        assert_eq!(
            Bencode::encode(&Bencode::BDict(dict)),
            b"d3:cow3:moo4:spam4:eggse"
        );
    }

    #[test]
    fn test_roundtrip_nested() {
        let mut inner = BTreeMap::new();
        inner.insert(b"k".to_vec(), Bencode::BNumber(-7));
        let original = Bencode::BList(vec![
            Bencode::BDict(inner),
            Bencode::BString(vec![0, 1, 2, 255]),
        ]);

        let encoded = Bencode::encode(&original);
        let decoded = Bencode::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_dict_get() {
        let data = b"d3:cow3:moo4:spami7ee";
        let bencode = Bencode::decode(&data.to_vec()).unwrap();

        assert_eq!(
            bencode.dict_get(b"cow").and_then(|v| v.as_bytes()),
            Some(b"moo".as_ref())
        );
        assert_eq!(
            bencode.dict_get(b"spam").and_then(|v| v.as_number()),
            Some(7)
        );
        assert!(bencode.dict_get(b"missing").is_none());
    }
}
