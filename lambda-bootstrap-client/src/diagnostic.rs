use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::any::type_name;

/// Diagnostic information about a failed invocation or initialization.
///
/// `error_type` is derived from the type name of the original error with
/// [`std::any::type_name`] as a fallback, which may not be descriptive
/// enough for conditional error handling. Implement `From` for your own
/// error types to control both fields:
///
/// ```
/// use lambda_bootstrap_client::Diagnostic;
///
/// #[derive(Debug)]
/// struct BadInput(&'static str);
///
/// impl From<BadInput> for Diagnostic {
///     fn from(error: BadInput) -> Diagnostic {
///         Diagnostic::new("BadInput", error.0)
///     }
/// }
/// ```
#[derive(Debug, Eq, PartialEq, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    /// The type of exception or error returned by the function.
    pub error_type: String,
    /// A string expression of the error.
    pub error_message: String,
}

impl Diagnostic {
    /// Build a diagnostic from explicit type and message strings.
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Diagnostic {
        Diagnostic {
            error_type: error_type.into(),
            error_message: error_message.into(),
        }
    }

    /// Render the control-plane wire body,
    /// `{"errorType":"…","errorMessage":"…"}`, escaping both values.
    ///
    /// The escaper walks raw UTF-8 bytes: `"` and `\` get a backslash
    /// prefix, control bytes below 0x20 become `\u00XX`. Everything else is
    /// copied through untouched.
    pub(crate) fn write_json(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(b"{\"errorType\":\"");
        write_escaped(&self.error_type, buf);
        buf.extend_from_slice(b"\",\"errorMessage\":\"");
        write_escaped(&self.error_message, buf);
        buf.extend_from_slice(b"\"}");
    }
}

fn write_escaped(value: &str, buf: &mut BytesMut) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for &b in value.as_bytes() {
        match b {
            0x22 => buf.extend_from_slice(b"\\\""),
            0x5c => buf.extend_from_slice(b"\\\\"),
            0x00..=0x1f => {
                buf.extend_from_slice(b"\\u00");
                buf.put_u8(HEX[usize::from(b >> 4)]);
                buf.put_u8(HEX[usize::from(b & 0x0f)]);
            }
            _ => buf.put_u8(b),
        }
    }
}

pub(crate) fn type_name_of_val<T>(_: T) -> &'static str {
    type_name::<T>()
}

impl From<Box<dyn std::error::Error + Send + Sync>> for Diagnostic {
    fn from(value: Box<dyn std::error::Error + Send + Sync>) -> Diagnostic {
        Diagnostic {
            error_type: type_name_of_val(&value).into(),
            error_message: value.to_string(),
        }
    }
}

impl From<Box<dyn std::error::Error>> for Diagnostic {
    fn from(value: Box<dyn std::error::Error>) -> Diagnostic {
        Diagnostic {
            error_type: type_name_of_val(&value).into(),
            error_message: value.to_string(),
        }
    }
}

impl From<std::convert::Infallible> for Diagnostic {
    fn from(value: std::convert::Infallible) -> Diagnostic {
        match value {}
    }
}

impl From<String> for Diagnostic {
    fn from(value: String) -> Diagnostic {
        Diagnostic {
            error_type: type_name_of_val(&value).into(),
            error_message: value,
        }
    }
}

impl From<&'static str> for Diagnostic {
    fn from(value: &'static str) -> Diagnostic {
        Diagnostic {
            error_type: type_name_of_val(value).into(),
            error_message: value.to_string(),
        }
    }
}

impl From<std::io::Error> for Diagnostic {
    fn from(value: std::io::Error) -> Diagnostic {
        Diagnostic {
            error_type: type_name_of_val(&value).into(),
            error_message: value.to_string(),
        }
    }
}
