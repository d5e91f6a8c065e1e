//! Wire format shared by the parameter RPC and the acquisition worker channel.
//!
//! Both streams carry frames of the form
//!
//! ```text
//! [u32 BE: len][len bytes of UTF-8 JSON]
//! ```
//!
//! The parameter RPC puts JSON-RPC 2.0 objects inside the frames; the worker
//! channel puts its own tagged messages there.

use std::io::{self, ErrorKind};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::IpcConfig;
use crate::{LinienError, Result};

pub const JSONRPC_VERSION: &str = "2.0";

fn jsonrpc_version() -> String {
    JSONRPC_VERSION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    pub id: Option<Value>,
}

impl IpcRequest {
    pub fn new(method: impl Into<String>, params: Value, id: u64) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            method: method.into(),
            params: Some(params),
            id: Some(Value::from(id)),
        }
    }
}

/// A reply carries exactly one of `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<IpcError>,
    #[serde(default)]
    pub id: Option<Value>,
}

impl IpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            result: None,
            error: Some(IpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Read one frame.
///
/// A stream that ends exactly on a frame boundary yields `None`; one that ends
/// inside the length prefix or the body is an `UnexpectedEof` error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        match reader.read(&mut prefix[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("stream ended after {} of 4 length bytes", filled),
                )
                .into())
            }
            n => filled += n,
        }
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > IpcConfig::MAX_MESSAGE_SIZE {
        return Err(LinienError::Validation {
            field: "frame_length".to_string(),
            message: format!("{} bytes exceeds limit of {}", len, IpcConfig::MAX_MESSAGE_SIZE),
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len as usize <= IpcConfig::MAX_MESSAGE_SIZE)
        .ok_or_else(|| LinienError::Validation {
            field: "frame_length".to_string(),
            message: format!("{} bytes exceeds limit of {}", body.len(), IpcConfig::MAX_MESSAGE_SIZE),
        })?;

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode its JSON body.
pub async fn read_message<T, R>(reader: &mut R) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    read_frame(reader)
        .await?
        .map(|body| serde_json::from_slice(&body).map_err(LinienError::from))
        .transpose()
}

pub async fn write_message<T, W>(writer: &mut W, message: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &serde_json::to_vec(message)?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn test_request_wire_shape() {
        let request = IpcRequest::new("get_param", json!({"name": "sweep_speed"}), 3);
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "jsonrpc": "2.0",
                "method": "get_param",
                "params": {"name": "sweep_speed"},
                "id": 3
            })
        );
    }

    #[test]
    fn test_error_reply_has_no_result_field() {
        let reply = IpcResponse::error(Some(json!(1)), -32001, "Unknown parameter: x".to_string());
        let value = serde_json::to_value(&reply).unwrap();
        assert!(value.get("result").is_none());
        assert_eq!(value["error"]["code"], -32001);
    }

    #[test]
    fn test_sparse_reply_decodes() {
        let reply: IpcResponse = serde_json::from_str(r#"{"result": [1, 2]}"#).unwrap();
        assert_eq!(reply.jsonrpc, JSONRPC_VERSION);
        assert_eq!(reply.result, Some(json!([1, 2])));
        assert!(reply.id.is_none());
    }

    #[tokio::test]
    async fn test_frame_layout() {
        let mut out = Vec::new();
        write_frame(&mut out, b"{}").await.unwrap();
        assert_eq!(out, [0, 0, 0, 2, b'{', b'}']);
    }

    #[tokio::test]
    async fn test_empty_stream_is_end_of_messages() {
        let mut input = Cursor::new(Vec::new());
        assert!(read_frame(&mut input).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_partial_length_prefix_is_an_error() {
        let result = read_frame(&mut Cursor::new(vec![0u8, 0])).await;
        assert!(matches!(
            result,
            Err(LinienError::Io { source: Some(ref e), .. }) if e.kind() == ErrorKind::UnexpectedEof
        ));
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let mut input = Vec::new();
        input.extend_from_slice(&((IpcConfig::MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes());
        input.extend_from_slice(&[0u8; 16]);

        let result = read_frame(&mut Cursor::new(input)).await;
        assert!(matches!(result, Err(LinienError::Validation { ref field, .. }) if field == "frame_length"));
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let mut stream = Vec::new();
        for seq in 1..=3 {
            write_message(&mut stream, &json!({ "seq": seq })).await.unwrap();
        }

        let mut input = Cursor::new(stream);
        for seq in 1..=3 {
            let message: Value = read_message(&mut input).await.unwrap().unwrap();
            assert_eq!(message["seq"], seq);
        }
        assert!(read_message::<Value, _>(&mut input).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let mut input = Vec::new();
        input.extend_from_slice(&10u32.to_be_bytes());
        input.extend_from_slice(b"abc");

        assert!(read_frame(&mut Cursor::new(input)).await.is_err());
    }

    #[tokio::test]
    async fn test_undecodable_body_is_a_json_error() {
        let mut stream = Vec::new();
        write_frame(&mut stream, b"not json").await.unwrap();

        let result = read_message::<Value, _>(&mut Cursor::new(stream)).await;
        assert!(result.is_err());
    }
}
