//! Conversions between Rust values and wire arguments/replies.
//!
//! `ToArg` turns values into command arguments, `FromReply` turns replies
//! back into values. Structured data goes through `Json<T>`.

use std::borrow::Cow;

use bytes::Bytes;
use chrono::NaiveDateTime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};
use crate::resp::{Arg, RespValue};

/// Wire format for dates.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Marks a value that travels as JSON text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

/// Converts a value into a command argument.
pub trait ToArg {
    fn to_arg(&self) -> ClientResult<Arg>;
}

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self) -> ClientResult<Arg> {
        (**self).to_arg()
    }
}

impl ToArg for Arg {
    fn to_arg(&self) -> ClientResult<Arg> {
        Ok(self.clone())
    }
}

impl ToArg for str {
    fn to_arg(&self) -> ClientResult<Arg> {
        Ok(Arg::from(self))
    }
}

impl ToArg for String {
    fn to_arg(&self) -> ClientResult<Arg> {
        Ok(Arg::from(self.as_str()))
    }
}

impl ToArg for [u8] {
    fn to_arg(&self) -> ClientResult<Arg> {
        Ok(Arg::from(self))
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> ClientResult<Arg> {
        Ok(Arg::from(self.as_slice()))
    }
}

impl ToArg for Bytes {
    fn to_arg(&self) -> ClientResult<Arg> {
        Ok(Arg::Bytes(self.clone()))
    }
}

impl ToArg for bool {
    fn to_arg(&self) -> ClientResult<Arg> {
        Ok(Arg::from(if *self { "TRUE" } else { "FALSE" }))
    }
}

impl ToArg for NaiveDateTime {
    fn to_arg(&self) -> ClientResult<Arg> {
        Ok(Arg::from(self.format(DATE_FORMAT).to_string()))
    }
}

impl<T: ToArg> ToArg for Option<T> {
    fn to_arg(&self) -> ClientResult<Arg> {
        match self {
            Some(value) => value.to_arg(),
            None => Ok(Arg::Null),
        }
    }
}

impl<T: Serialize> ToArg for Json<T> {
    fn to_arg(&self) -> ClientResult<Arg> {
        Ok(Arg::from(serde_json::to_vec(&self.0)?))
    }
}

macro_rules! display_to_arg {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ToArg for $ty {
                fn to_arg(&self) -> ClientResult<Arg> {
                    Ok(Arg::from(self.to_string()))
                }
            }
        )*
    };
}

display_to_arg!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

/// Converts a reply into a value.
///
/// Nil replies are handled by the caller (`Option<T>` or `Client::get`).
pub trait FromReply: Sized {
    fn from_reply(value: RespValue) -> ClientResult<Self>;
}

impl FromReply for RespValue {
    fn from_reply(value: RespValue) -> ClientResult<Self> {
        Ok(value)
    }
}

impl<T: FromReply> FromReply for Option<T> {
    fn from_reply(value: RespValue) -> ClientResult<Self> {
        if value.is_nil() {
            Ok(None)
        } else {
            T::from_reply(value).map(Some)
        }
    }
}

impl FromReply for bool {
    fn from_reply(value: RespValue) -> ClientResult<Self> {
        if let RespValue::Integer(n) = value {
            return Ok(n != 0);
        }
        let text = reply_text(&value)?;
        let text = text.trim();
        if ["OK", "PONG", "TRUE", "1"].iter().any(|token| text.eq_ignore_ascii_case(token)) {
            Ok(true)
        } else if ["FALSE", "0", ""].iter().any(|token| text.eq_ignore_ascii_case(token)) {
            Ok(false)
        } else {
            Err(mismatch::<bool>(&value))
        }
    }
}

impl FromReply for String {
    fn from_reply(value: RespValue) -> ClientResult<Self> {
        match value {
            RespValue::Simple(text) => Ok(text),
            RespValue::Integer(n) => Ok(n.to_string()),
            RespValue::Bulk(Some(bytes)) => String::from_utf8(bytes.to_vec())
                .map_err(|err| ClientError::Conversion(format!("reply is not UTF-8: {err}"))),
            other => Err(mismatch::<String>(&other)),
        }
    }
}

impl FromReply for Vec<u8> {
    fn from_reply(value: RespValue) -> ClientResult<Self> {
        Bytes::from_reply(value).map(|bytes| bytes.to_vec())
    }
}

impl FromReply for Bytes {
    fn from_reply(value: RespValue) -> ClientResult<Self> {
        match value {
            RespValue::Bulk(Some(bytes)) => Ok(bytes),
            RespValue::Simple(text) => Ok(Bytes::from(text)),
            RespValue::Integer(n) => Ok(Bytes::from(n.to_string())),
            other => Err(mismatch::<Bytes>(&other)),
        }
    }
}

impl FromReply for NaiveDateTime {
    fn from_reply(value: RespValue) -> ClientResult<Self> {
        let text = reply_text(&value)?;
        NaiveDateTime::parse_from_str(text.trim(), DATE_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(text.trim(), "%Y-%m-%dT%H:%M:%S%.f"))
            .map_err(|err| ClientError::Conversion(format!("invalid date {text:?}: {err}")))
    }
}

impl<T: DeserializeOwned> FromReply for Json<T> {
    fn from_reply(value: RespValue) -> ClientResult<Self> {
        match value {
            RespValue::Bulk(Some(bytes)) => Ok(Json(serde_json::from_slice(&bytes)?)),
            other => {
                let text = reply_text(&other)?;
                Ok(Json(serde_json::from_str(&text)?))
            }
        }
    }
}

/// Array replies (MGET); nil elements become `None`.
impl<T: FromReply> FromReply for Vec<Option<T>> {
    fn from_reply(value: RespValue) -> ClientResult<Self> {
        match value {
            RespValue::Array(items) => items.into_iter().map(Option::<T>::from_reply).collect(),
            other => Err(mismatch::<Vec<Option<T>>>(&other)),
        }
    }
}

macro_rules! parse_from_reply {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromReply for $ty {
                fn from_reply(value: RespValue) -> ClientResult<Self> {
                    if let RespValue::Integer(n) = value {
                        return <$ty>::try_from(n)
                            .map_err(|_| ClientError::Conversion(format!("{n} out of range for {}", stringify!($ty))));
                    }
                    let text = reply_text(&value)?;
                    text.trim()
                        .parse::<$ty>()
                        .map_err(|_| ClientError::Conversion(format!("{text:?} is not a valid {}", stringify!($ty))))
                }
            }
        )*
    };
}

parse_from_reply!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl FromReply for f64 {
    fn from_reply(value: RespValue) -> ClientResult<Self> {
        if let RespValue::Integer(n) = value {
            return Ok(n as f64);
        }
        let text = reply_text(&value)?;
        text.trim()
            .parse()
            .map_err(|_| ClientError::Conversion(format!("{text:?} is not a valid f64")))
    }
}

impl FromReply for f32 {
    fn from_reply(value: RespValue) -> ClientResult<Self> {
        f64::from_reply(value).map(|n| n as f32)
    }
}

fn reply_text(value: &RespValue) -> ClientResult<Cow<'_, str>> {
    match value {
        RespValue::Simple(text) => Ok(Cow::Borrowed(text)),
        RespValue::Integer(n) => Ok(Cow::Owned(n.to_string())),
        RespValue::Bulk(Some(bytes)) => std::str::from_utf8(bytes)
            .map(Cow::Borrowed)
            .map_err(|err| ClientError::Conversion(format!("reply is not UTF-8: {err}"))),
        other => Err(ClientError::Conversion(format!("expected a scalar reply, got {other:?}"))),
    }
}

fn mismatch<T>(value: &RespValue) -> ClientError {
    ClientError::Conversion(format!(
        "cannot convert {value:?} into {}",
        std::any::type_name::<T>()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::{decode_command, Command};
    use bytes::BytesMut;
    use chrono::NaiveDate;
    use std::io::Cursor;

    fn bulk(text: &str) -> RespValue {
        RespValue::Bulk(Some(Bytes::copy_from_slice(text.as_bytes())))
    }

    fn arg_text(value: impl ToArg) -> String {
        match value.to_arg().unwrap() {
            Arg::Bytes(bytes) => String::from_utf8(bytes.to_vec()).unwrap(),
            Arg::Null => "<null>".to_string(),
        }
    }

    #[test]
    fn scalar_arguments() {
        assert_eq!(arg_text("text"), "text");
        assert_eq!(arg_text(-7i32), "-7");
        assert_eq!(arg_text(2.5f64), "2.5");
        assert_eq!(arg_text(true), "TRUE");
        assert_eq!(arg_text(false), "FALSE");
        assert_eq!(arg_text(None::<i32>), "<null>");
    }

    #[test]
    fn date_argument_uses_fixed_format() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 1)
            .unwrap();
        assert_eq!(arg_text(date), "2024-03-09 07:05:01");
        assert_eq!(NaiveDateTime::from_reply(bulk("2024-03-09 07:05:01")).unwrap(), date);
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u32,
        name: String,
    }

    #[test]
    fn json_round_trip() {
        let user = User { id: 1, name: "Mo".into() };
        assert_eq!(arg_text(Json(user.clone())), r#"{"id":1,"name":"Mo"}"#);
        let Json(back) = Json::<User>::from_reply(bulk(r#"{"id":1,"name":"Mo"}"#)).unwrap();
        assert_eq!(back, user);
    }

    #[test]
    fn booleans_from_status_tokens() {
        assert!(bool::from_reply(RespValue::Simple("OK".into())).unwrap());
        assert!(bool::from_reply(RespValue::Simple("PONG".into())).unwrap());
        assert!(bool::from_reply(RespValue::Integer(1)).unwrap());
        assert!(!bool::from_reply(RespValue::Integer(0)).unwrap());
        assert!(bool::from_reply(bulk("true")).unwrap());
        assert!(bool::from_reply(bulk("maybe")).is_err());
    }

    #[test]
    fn numbers_and_strings() {
        assert_eq!(i64::from_reply(RespValue::Integer(42)).unwrap(), 42);
        assert_eq!(u16::from_reply(bulk("8080")).unwrap(), 8080);
        assert!(matches!(u8::from_reply(RespValue::Integer(300)), Err(ClientError::Conversion(_))));
        assert_eq!(f64::from_reply(bulk("1.5")).unwrap(), 1.5);
        assert_eq!(String::from_reply(bulk("Hello")).unwrap(), "Hello");
        assert_eq!(Vec::<u8>::from_reply(bulk("ab")).unwrap(), b"ab".to_vec());
        assert!(matches!(i32::from_reply(bulk("abc")), Err(ClientError::Conversion(_))));
    }

    fn through_the_wire(command: &Command) -> Vec<Vec<Arg>> {
        let mut out = BytesMut::new();
        command.encode_into(&mut out);
        let mut reader = Cursor::new(out.to_vec());
        let frames = (0..command.expected_replies())
            .map(|_| decode_command(&mut reader).unwrap())
            .collect();
        assert_eq!(reader.position() as usize, out.len());
        frames
    }

    fn as_reply(arg: &Arg) -> RespValue {
        RespValue::Bulk(arg.as_bytes().map(Bytes::copy_from_slice))
    }

    #[test]
    fn every_argument_type_survives_the_wire() {
        let date = NaiveDate::from_ymd_opt(2023, 12, 31)
            .unwrap()
            .and_hms_opt(23, 59, 58)
            .unwrap();
        let user = User { id: 9, name: "Zoë".into() };
        let args: Vec<Arg> = vec![
            "text".to_arg(),
            String::from("ünïcode").to_arg(),
            b"\x00\r\n\xff".to_vec().to_arg(),
            Bytes::from_static(b"raw").to_arg(),
            true.to_arg(),
            false.to_arg(),
            (-7i8).to_arg(),
            65535u16.to_arg(),
            u64::MAX.to_arg(),
            i128::MIN.to_arg(),
            1.5f32.to_arg(),
            0.1f64.to_arg(),
            date.to_arg(),
            Some(5i32).to_arg(),
            None::<i32>.to_arg(),
            Json(user.clone()).to_arg(),
        ]
        .into_iter()
        .collect::<ClientResult<_>>()
        .unwrap();

        let frames = through_the_wire(&Command::single("MSET", args.clone()));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], Arg::from("MSET"));
        let wire = &frames[0][1..];
        assert_eq!(wire, &args[..]);

        assert_eq!(String::from_reply(as_reply(&wire[0])).unwrap(), "text");
        assert_eq!(String::from_reply(as_reply(&wire[1])).unwrap(), "ünïcode");
        assert_eq!(Vec::<u8>::from_reply(as_reply(&wire[2])).unwrap(), b"\x00\r\n\xff".to_vec());
        assert_eq!(Bytes::from_reply(as_reply(&wire[3])).unwrap(), Bytes::from_static(b"raw"));
        assert!(bool::from_reply(as_reply(&wire[4])).unwrap());
        assert!(!bool::from_reply(as_reply(&wire[5])).unwrap());
        assert_eq!(i8::from_reply(as_reply(&wire[6])).unwrap(), -7);
        assert_eq!(u16::from_reply(as_reply(&wire[7])).unwrap(), 65535);
        assert_eq!(u64::from_reply(as_reply(&wire[8])).unwrap(), u64::MAX);
        assert_eq!(String::from_reply(as_reply(&wire[9])).unwrap(), i128::MIN.to_string());
        assert_eq!(f32::from_reply(as_reply(&wire[10])).unwrap(), 1.5);
        assert_eq!(f64::from_reply(as_reply(&wire[11])).unwrap(), 0.1);
        assert_eq!(NaiveDateTime::from_reply(as_reply(&wire[12])).unwrap(), date);
        assert_eq!(Option::<i32>::from_reply(as_reply(&wire[13])).unwrap(), Some(5));
        assert_eq!(Option::<i32>::from_reply(as_reply(&wire[14])).unwrap(), None);
        assert_eq!(Json::<User>::from_reply(as_reply(&wire[15])).unwrap().into_inner(), user);

        let mixed = Command::multiple([
            Command::single("SET", [args[0].clone(), args[15].clone()]),
            Command::batch(
                "EXPIRE",
                [
                    (args[12].clone(), args[8].clone()),
                    (args[14].clone(), args[11].clone()),
                ],
            ),
        ]);
        assert_eq!(
            through_the_wire(&mixed),
            vec![
                vec![Arg::from("SET"), args[0].clone(), args[15].clone()],
                vec![Arg::from("EXPIRE"), args[12].clone(), args[8].clone()],
                vec![Arg::from("EXPIRE"), Arg::Null, args[11].clone()],
            ]
        );
    }

    #[test]
    fn arrays_and_nil() {
        let reply = RespValue::Array(vec![bulk("a"), RespValue::Bulk(None), bulk("c")]);
        let values = Vec::<Option<String>>::from_reply(reply).unwrap();
        assert_eq!(values, vec![Some("a".into()), None, Some("c".into())]);
        assert!(String::from_reply(RespValue::Bulk(None)).is_err());
    }
}
