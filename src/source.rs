//! Decode sources: anything that can be opened by target string and then
//! pulled for decoded pictures.

use crate::cli::TransportMode;
use crate::error::StreamError;
use crate::mailbox::{Frame, PixelLayout};
use crate::target::{display_endpoint, percent_decode_userinfo};
use anyhow::{Context, Result, anyhow};
use futures_util::StreamExt;
use openh264::decoder::Decoder;
use openh264::formats::YUVSource;
use retina::client::{
    Credentials, Demuxed, PlayOptions, Session, SessionOptions, SetupOptions, TcpTransportOptions,
    Transport, UdpTransportOptions,
};
use retina::codec::{CodecItem, ParametersRef};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// How long a single pull may wait for a picture before reporting "empty".
const PULL_WINDOW: Duration = Duration::from_millis(40);

/// Upper bound for DESCRIBE + SETUP + PLAY against one camera.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A connection-oriented producer of decoded frames.
///
/// `next_frame` yields `Ok(None)` when nothing is ready yet; the caller
/// decides how long to tolerate that.
pub trait DecodeSource: Send + Sync + 'static {
    type Handle: Send;

    fn open(&self, target: &str)
    -> impl Future<Output = Result<Self::Handle, StreamError>> + Send;

    fn next_frame(
        &self,
        handle: &mut Self::Handle,
    ) -> impl Future<Output = Result<Option<Frame>, StreamError>> + Send;

    fn release(&self, handle: Self::Handle);
}

/// RTSP client + software H.264 decoder.
#[derive(Debug, Clone, Copy)]
pub struct RtspSource {
    transport: TransportMode,
    pull_window: Duration,
    connect_timeout: Duration,
}

impl RtspSource {
    pub fn new(transport: TransportMode) -> Self {
        Self {
            transport,
            pull_window: PULL_WINDOW,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

pub struct RtspSession {
    endpoint: String,
    demuxed: Demuxed,
    decoder: Decoder,
    stream_index: usize,
    annexb: Vec<u8>,
}

impl DecodeSource for RtspSource {
    type Handle = RtspSession;

    async fn open(&self, target: &str) -> Result<RtspSession, StreamError> {
        let connecting = connect_session(target, self.transport);
        match tokio::time::timeout(self.connect_timeout, connecting).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(err)) => Err(StreamError::connect(format_args!("{err:#}"))),
            Err(_elapsed) => Err(StreamError::Connect(format!(
                "timed out after {} ms waiting for {}",
                self.connect_timeout.as_millis(),
                display_endpoint(target)
            ))),
        }
    }

    async fn next_frame(&self, handle: &mut RtspSession) -> Result<Option<Frame>, StreamError> {
        match tokio::time::timeout(self.pull_window, handle.next_picture()).await {
            Ok(result) => result,
            Err(_elapsed) => Ok(None),
        }
    }

    fn release(&self, handle: RtspSession) {
        debug!(endpoint = %handle.endpoint, "releasing RTSP session");
        drop(handle);
    }
}

impl RtspSession {
    /// Reads demuxed items until one decodes into a picture.
    async fn next_picture(&mut self) -> Result<Option<Frame>, StreamError> {
        loop {
            let item = match self.demuxed.next().await {
                Some(Ok(item)) => item,
                Some(Err(err)) => return Err(StreamError::Connect(format!("demux failed: {err}"))),
                None => return Err(StreamError::Connect("stream ended".to_owned())),
            };

            let CodecItem::VideoFrame(frame) = item else {
                continue;
            };
            if frame.stream_id() != self.stream_index {
                continue;
            }

            if frame.has_new_parameters()
                && let Some(extra_config) = read_h264_extra_config(&self.demuxed, self.stream_index)
            {
                let _ = self.decoder.decode(&extra_config);
            }

            avcc_frame_to_annexb(frame.data(), &mut self.annexb).map_err(StreamError::decode)?;
            match self.decoder.decode(&self.annexb) {
                Ok(Some(yuv)) => {
                    let (width, height) = yuv.dimensions();
                    let mut rgb = vec![0_u8; width * height * 3];
                    yuv.write_rgb8(&mut rgb);
                    return Ok(Some(Frame::new(width, height, PixelLayout::Rgb8, rgb)));
                }
                Ok(None) => {}
                Err(err) => return Err(StreamError::decode(err)),
            }
        }
    }
}

async fn connect_session(target: &str, transport_mode: TransportMode) -> Result<RtspSession> {
    let parsed_with_auth = Url::parse(target).with_context(|| {
        format!("invalid RTSP target: {}", display_endpoint(target))
    })?;
    let mut parsed = parsed_with_auth.clone();

    let creds = extract_credentials(&parsed);
    if !parsed.username().is_empty() {
        parsed
            .set_username("")
            .map_err(|()| anyhow!("failed stripping username from RTSP URL"))?;
    }
    if parsed.password().is_some() {
        parsed
            .set_password(None)
            .map_err(|()| anyhow!("failed stripping password from RTSP URL"))?;
    }

    let session_options = SessionOptions::default().creds(creds);
    let mut session = match Session::describe(parsed, session_options).await {
        Ok(session) => session,
        Err(primary_err) => {
            // Some cameras only accept credentials embedded in the URL.
            if parsed_with_auth.username().is_empty() {
                return Err(primary_err).context("RTSP DESCRIBE failed");
            }

            match Session::describe(parsed_with_auth, SessionOptions::default()).await {
                Ok(session) => session,
                Err(fallback_err) => {
                    return Err(anyhow!(
                        "RTSP DESCRIBE failed (session creds): {primary_err}; fallback failed (URL creds): {fallback_err}"
                    ));
                }
            }
        }
    };

    let stream_index = pick_h264_stream(&session)?;
    session
        .setup(
            stream_index,
            SetupOptions::default().transport(to_transport(transport_mode)),
        )
        .await
        .context("RTSP SETUP failed")?;

    let playing = session
        .play(PlayOptions::default())
        .await
        .context("RTSP PLAY failed")?;

    let demuxed = playing.demuxed().context("RTSP demux setup failed")?;
    let mut decoder = Decoder::new().context("failed to initialize H264 decoder")?;
    if let Some(extra_config) = read_h264_extra_config(&demuxed, stream_index) {
        let _ = decoder.decode(&extra_config);
    }

    let endpoint = display_endpoint(target);
    info!(%endpoint, stream_index, "RTSP session playing");
    Ok(RtspSession {
        endpoint,
        demuxed,
        decoder,
        stream_index,
        annexb: Vec::with_capacity(4096),
    })
}

fn extract_credentials(parsed: &Url) -> Option<Credentials> {
    if parsed.username().is_empty() {
        return None;
    }

    Some(Credentials {
        username: percent_decode_userinfo(parsed.username()),
        password: percent_decode_userinfo(parsed.password().unwrap_or("")),
    })
}

fn pick_h264_stream(session: &Session<retina::client::Described>) -> Result<usize> {
    session
        .streams()
        .iter()
        .enumerate()
        .find(|(_, stream)| stream.media() == "video" && stream.encoding_name() == "h264")
        .map(|(idx, _)| idx)
        .ok_or_else(|| anyhow!("no H264 video stream found in RTSP presentation"))
}

fn to_transport(mode: TransportMode) -> Transport {
    match mode {
        TransportMode::Tcp => Transport::Tcp(TcpTransportOptions::default()),
        TransportMode::Udp => Transport::Udp(UdpTransportOptions::default()),
    }
}

fn read_h264_extra_config(demuxed: &Demuxed, stream_index: usize) -> Option<Vec<u8>> {
    let stream = demuxed.streams().get(stream_index)?;
    let ParametersRef::Video(video_params) = stream.parameters()? else {
        return None;
    };

    avcc_extra_data_to_annexb(video_params.extra_data()).ok()
}

fn avcc_frame_to_annexb(input: &[u8], output: &mut Vec<u8>) -> Result<()> {
    output.clear();

    let mut cursor = 0_usize;
    while cursor + 4 <= input.len() {
        let nal_len = u32::from_be_bytes([
            input[cursor],
            input[cursor + 1],
            input[cursor + 2],
            input[cursor + 3],
        ]) as usize;
        cursor += 4;

        if cursor + nal_len > input.len() {
            return Err(anyhow!("invalid AVCC frame: NAL length exceeds payload"));
        }

        output.extend_from_slice(&[0, 0, 0, 1]);
        output.extend_from_slice(&input[cursor..cursor + nal_len]);
        cursor += nal_len;
    }

    if cursor != input.len() {
        return Err(anyhow!("invalid AVCC frame: trailing bytes"));
    }

    Ok(())
}

fn avcc_extra_data_to_annexb(extra: &[u8]) -> Result<Vec<u8>> {
    if extra.len() < 7 {
        return Err(anyhow!("AVCC extradata too short"));
    }

    let mut cursor = 5_usize;
    let mut output = Vec::with_capacity(extra.len() + 32);

    let sps_count = usize::from(extra[cursor] & 0x1f);
    cursor += 1;
    copy_parameter_sets(extra, &mut cursor, sps_count, "SPS", &mut output)?;

    if cursor >= extra.len() {
        return Err(anyhow!("AVCC PPS count missing"));
    }
    let pps_count = usize::from(extra[cursor]);
    cursor += 1;
    copy_parameter_sets(extra, &mut cursor, pps_count, "PPS", &mut output)?;

    Ok(output)
}

fn copy_parameter_sets(
    extra: &[u8],
    cursor: &mut usize,
    count: usize,
    kind: &str,
    output: &mut Vec<u8>,
) -> Result<()> {
    for _ in 0..count {
        if *cursor + 2 > extra.len() {
            return Err(anyhow!("AVCC {kind} length missing"));
        }
        let len = usize::from(u16::from_be_bytes([extra[*cursor], extra[*cursor + 1]]));
        *cursor += 2;
        if *cursor + len > extra.len() {
            return Err(anyhow!("AVCC {kind} payload exceeds size"));
        }

        output.extend_from_slice(&[0, 0, 0, 1]);
        output.extend_from_slice(&extra[*cursor..*cursor + len]);
        *cursor += len;
    }
    Ok(())
}
