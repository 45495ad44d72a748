use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Generous ceiling for a single framed message; a training packet carries at
/// most one captured application payload.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub type FrameStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Wraps a connected stream in the length-delimited codec both ends of the
/// ingress and egress speak.
pub fn framed(stream: TcpStream) -> FrameStream {
    Framed::new(
        stream,
        LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec(),
    )
}

/// Endpoint URLs are configured as `tcp://host:port`; the bare `host:port`
/// form is accepted too.
pub fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("tcp://").unwrap_or(url)
}
