/// Error taxonomy shared by the HTTP/1.1 and HTTP/2 readers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    #[error("invalid use")]
    InvalidUse,

    /// Not a failure: feed more bytes and call again. No input was
    /// consumed.
    #[error("need more data")]
    MoreData,

    #[error("protocol format error: {0}")]
    ProtoFormat(String),

    #[error("invalid frame type")]
    InvalidFrameType,

    #[error("invalid setting type")]
    InvalidSettingType,

    #[error("invalid header table index")]
    InvalidTableIndex,

    #[error("settings frame length not a multiple of 6")]
    MisalignedSettings,

    #[error("unsupported data: {0}")]
    UnsupportedData(String),

    #[error("internal error")]
    Internal,
}
