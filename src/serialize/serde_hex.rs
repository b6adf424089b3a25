//! Addresses serialize as `"0x7f1e2c000010"` strings, so reports stay
//! readable. Plain integers are accepted when deserializing.

use std::fmt;

use serde::{de::Visitor, Deserializer, Serializer};

pub fn serialize<S>(value: &usize, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(&format_args!("{value:#x}"))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    struct V;

    impl<'de> Visitor<'de> for V {
        type Value = usize;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an address as a 0x-prefixed hex string or an integer")
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(v as usize)
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            let digits = v.strip_prefix("0x").unwrap_or(v);
            usize::from_str_radix(digits, 16).map_err(E::custom)
        }
    }

    deserializer.deserialize_any(V)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Addr {
        #[serde(with = "super")]
        at: usize,
    }

    #[test]
    fn addresses_are_hex_strings() {
        let json = serde_json::to_string(&Addr { at: 0xdead0 }).unwrap();
        assert_eq!(json, r#"{"at":"0xdead0"}"#);
        let back: Addr = serde_json::from_str(&json).unwrap();
        assert_eq!(back.at, 0xdead0);
        let from_int: Addr = serde_json::from_str(r#"{"at":16}"#).unwrap();
        assert_eq!(from_int.at, 16);
    }
}
