//! Message framing for the remote-call channel.
//!
//! Each message is a big-endian `u32` length followed by a bincode body,
//! framed by `LengthDelimitedCodec`. Control calls are request/response;
//! frame pushes to a consumer are one-way.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::consumer::EndpointRef;
use crate::device::settings::DeviceSettings;
use crate::device::DeviceStatus;
use crate::hardware::{ParamDescriptor, ParamValue};
use crate::pipeline::{CorrectionFrame, DeliveredFrame, Transform};

/// Upper bound on one encoded message.
pub const MAX_MESSAGE_LEN: usize = 256 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// A framed TCP connection carrying whole messages.
pub type Transport = Framed<TcpStream, LengthDelimitedCodec>;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("no reply within {0:?}")]
    TimedOut(Duration),

    #[error("connection closed by peer")]
    Closed,
}

/// Control calls on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Ping,
    Enable,
    Disable,
    Configure(DeviceSettings),
    Settings,
    Status,
    SetClient(Option<EndpointRef>),
    Trigger,
    GoSilent,
    GoLoud,
    SetCorrection(Option<CorrectionFrame>),
    GetId,
    SetTransform(Transform),
    Transform,
    DescribeSettings,
    GetSetting(String),
    SetSetting(String, SettingValue),
}

impl Request {
    /// Call name for logs. Payloads such as correction frames stay out.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::Enable => "enable",
            Request::Disable => "disable",
            Request::Configure(_) => "configure",
            Request::Settings => "settings",
            Request::Status => "status",
            Request::SetClient(_) => "set_client",
            Request::Trigger => "trigger",
            Request::GoSilent => "go_silent",
            Request::GoLoud => "go_loud",
            Request::SetCorrection(_) => "set_correction",
            Request::GetId => "get_id",
            Request::SetTransform(_) => "set_transform",
            Request::Transform => "transform",
            Request::DescribeSettings => "describe_settings",
            Request::GetSetting(_) => "get_setting",
            Request::SetSetting(..) => "set_setting",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Done,
    Pong,
    Settings(DeviceSettings),
    Status(DeviceStatus),
    Id(String),
    Transform(Transform),
    SettingDescriptions(Vec<ParamDescriptor>),
    Setting(SettingValue),
}

/// A hardware parameter value on the wire.
///
/// [`ParamValue`] is untagged for config files, which bincode cannot decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<ParamValue> for SettingValue {
    fn from(value: ParamValue) -> Self {
        match value {
            ParamValue::Bool(v) => SettingValue::Bool(v),
            ParamValue::Int(v) => SettingValue::Int(v),
            ParamValue::Float(v) => SettingValue::Float(v),
            ParamValue::Text(v) => SettingValue::Text(v),
        }
    }
}

impl From<SettingValue> for ParamValue {
    fn from(value: SettingValue) -> Self {
        match value {
            SettingValue::Bool(v) => ParamValue::Bool(v),
            SettingValue::Int(v) => ParamValue::Int(v),
            SettingValue::Float(v) => ParamValue::Float(v),
            SettingValue::Text(v) => ParamValue::Text(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    HardwareCallFailed,
    AcquisitionTimeout,
    AcquisitionFailed,
    OutOfMemory,
    EndpointNotFound,
    NoSoftTrigger,
    DeliveryFailed,
    InvalidSettings,
    InvalidState,
    ShutDown,
    Other,
}

/// A control-surface error as it crosses the process boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

pub type Response = Result<Reply, RemoteError>;

/// One-way push from a device to a consumer listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramePush {
    pub consumer: u64,
    pub frame: DeliveredFrame,
}

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(HEADER_LEN)
        .max_frame_length(MAX_MESSAGE_LEN)
        .new_codec()
}

pub fn framed<S: AsyncRead + AsyncWrite>(stream: S) -> Framed<S, LengthDelimitedCodec> {
    Framed::new(stream, codec())
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, WireError> {
    let body = bincode::serialize(message)?;
    if body.len() > MAX_MESSAGE_LEN {
        return Err(WireError::TooLarge {
            size: body.len(),
            max: MAX_MESSAGE_LEN,
        });
    }
    Ok(Bytes::from(body))
}

pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, WireError> {
    Ok(bincode::deserialize(body)?)
}

pub async fn send<T, S>(framed: &mut Framed<S, LengthDelimitedCodec>, message: &T) -> Result<(), WireError>
where
    T: Serialize,
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(encode(message)?).await?;
    Ok(())
}

/// Next whole message. [`WireError::Closed`] once the peer hangs up.
pub async fn recv<T, S>(framed: &mut Framed<S, LengthDelimitedCodec>) -> Result<T, WireError>
where
    T: DeserializeOwned,
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(Ok(body)) => decode(&body),
        Some(Err(e)) => Err(e.into()),
        None => Err(WireError::Closed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::FrameMetadata;
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn test_messages_are_length_prefixed() {
        let mut buf = BytesMut::new();
        codec()
            .encode(encode(&Request::Trigger).unwrap(), &mut buf)
            .unwrap();
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - HEADER_LEN);
    }

    #[tokio::test]
    async fn test_back_to_back_messages() {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let mut tx = framed(near);
        let mut rx = framed(far);
        let push = FramePush {
            consumer: 7,
            frame: DeliveredFrame {
                data: Bytes::from_static(&[1, 2, 3]),
                meta: FrameMetadata::default(),
            },
        };
        send(&mut tx, &Request::GoSilent).await.unwrap();
        send(&mut tx, &push).await.unwrap();
        drop(tx);

        assert_eq!(recv::<Request, _>(&mut rx).await.unwrap(), Request::GoSilent);
        assert_eq!(recv::<FramePush, _>(&mut rx).await.unwrap(), push);
        assert!(matches!(
            recv::<Request, _>(&mut rx).await,
            Err(WireError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_setting_values_cross_the_wire() {
        let (near, far) = tokio::io::duplex(4096);
        let mut tx = framed(near);
        let mut rx = framed(far);
        let request = Request::SetSetting("FanSpeed".into(), ParamValue::Text("Low".into()).into());
        send(&mut tx, &request).await.unwrap();
        let back: Request = recv(&mut rx).await.unwrap();
        assert_eq!(back, request);
        let Request::SetSetting(_, value) = back else {
            panic!("wrong request");
        };
        assert_eq!(ParamValue::from(value), ParamValue::Text("Low".into()));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let mut buf = BytesMut::from(&u32::MAX.to_be_bytes()[..]);
        let err = codec().decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_request_names_omit_payload() {
        let request = Request::SetCorrection(Some(CorrectionFrame {
            width: 1024,
            height: 1024,
            format: Default::default(),
            data: vec![0; 4],
        }));
        assert_eq!(request.name(), "set_correction");
        assert_eq!(Request::GetSetting("FanSpeed".into()).name(), "get_setting");
    }
}
