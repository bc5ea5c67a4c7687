//! Wire protocol: the closed header vocabulary, the `|`-separated message
//! codec and the length-prefixed chunked framing used on TCP streams.

use std::fmt;
use std::io;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::MessageError;

const SEPARATOR: char = '|';

/// Payloads are written and read in chunks of this many bytes.
pub const CHUNK_SIZE: usize = 2048;

/// Largest frame payload a peer may announce.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Header {
    Ack,
    Accept,
    AddMember,
    CreateIdea,
    CreateOpinion,
    Data,
    Database,
    Deconnection,
    Invitation,
    Ping,
    Pong,
    Reject,
    RequestParent,
}

impl Header {
    pub const ALL: [Header; 13] = [
        Header::Ack,
        Header::Accept,
        Header::AddMember,
        Header::CreateIdea,
        Header::CreateOpinion,
        Header::Data,
        Header::Database,
        Header::Deconnection,
        Header::Invitation,
        Header::Ping,
        Header::Pong,
        Header::Reject,
        Header::RequestParent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Header::Ack => "ACK",
            Header::Accept => "ACCEPT",
            Header::AddMember => "ADD_MEMBER",
            Header::CreateIdea => "CREATE_IDEA",
            Header::CreateOpinion => "CREATE_OPINION",
            Header::Data => "DATA",
            Header::Database => "DATABASE",
            Header::Deconnection => "DECONNECTION",
            Header::Invitation => "INVITATION",
            Header::Ping => "PING",
            Header::Pong => "PONG",
            Header::Reject => "REJECT",
            Header::RequestParent => "REQUEST_PARENT",
        }
    }

    /// Pre-membership handshake headers skip the membership check and are
    /// never relayed.
    pub fn is_handshake(self) -> bool {
        matches!(self, Header::Invitation)
    }

    /// Headers whose messages are relayed hop-by-hop across the tree.
    pub fn propagates(self) -> bool {
        matches!(
            self,
            Header::AddMember | Header::CreateIdea | Header::CreateOpinion | Header::Deconnection
        )
    }

    /// Headers whose sender may be recognized by the member key in the
    /// content when its address is not on record.
    pub fn authenticates_by_key(self) -> bool {
        matches!(self, Header::RequestParent)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Header {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Header::ALL
            .into_iter()
            .find(|header| header.as_str() == s)
            .ok_or_else(|| MessageError::InvalidHeader(s.to_string()))
    }
}

/// A protocol message. Created by a sender, transmitted once, then dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: Header,
    content: Option<String>,
    community_id: Option<String>,
}

impl Message {
    /// A bare message with neither content nor community, e.g. `ACCEPT`.
    pub fn new(header: Header) -> Self {
        Self {
            header,
            content: None,
            community_id: None,
        }
    }

    /// A message scoped to a community.
    pub fn for_community(
        header: Header,
        community_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(header)
            .with_community(community_id)
            .with_content(content)
    }

    /// Sets the content. An empty string means "no content".
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        let content = content.into();
        self.content = (!content.is_empty()).then_some(content);
        self
    }

    pub fn with_community(mut self, community_id: impl Into<String>) -> Self {
        self.community_id = Some(community_id.into());
        self
    }

    pub fn header(&self) -> Header {
        self.header
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn community_id(&self) -> Option<&str> {
        self.community_id.as_deref()
    }

    /// Renders `HEADER|content` or `HEADER|community_id|content`.
    pub fn encode(&self) -> Result<String, MessageError> {
        let content = self.content.as_deref().unwrap_or_default();
        match self.community_id.as_deref() {
            None if content.contains(SEPARATOR) => Err(MessageError::MalformedMessage(
                "content without a community id cannot contain '|'".into(),
            )),
            None => Ok(format!("{}{SEPARATOR}{content}", self.header)),
            Some("") => Err(MessageError::MalformedMessage(
                "community id cannot be empty".into(),
            )),
            Some(community_id) if community_id.contains(SEPARATOR) => Err(
                MessageError::MalformedMessage("community id cannot contain '|'".into()),
            ),
            Some(community_id) => Ok(format!(
                "{}{SEPARATOR}{community_id}{SEPARATOR}{content}",
                self.header
            )),
        }
    }

    /// Parses a wire string. Only the first two separators are significant;
    /// anything after them belongs to the content verbatim.
    pub fn decode(wire: &str) -> Result<Self, MessageError> {
        let (header, rest) = wire.split_once(SEPARATOR).ok_or_else(|| {
            MessageError::MalformedMessage(format!("missing '{SEPARATOR}' separator"))
        })?;
        let header: Header = header.parse()?;

        let message = match rest.split_once(SEPARATOR) {
            Some((community_id, content)) => Message::new(header)
                .with_community(community_id)
                .with_content(content),
            None => Message::new(header).with_content(rest),
        };
        Ok(message)
    }
}

/// Writes one frame: a big-endian `u32` length followed by the payload,
/// pushed out in [`CHUNK_SIZE`] pieces.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {MAX_FRAME_LEN}", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    for chunk in payload.chunks(CHUNK_SIZE) {
        writer.write_all(chunk).await?;
    }
    writer.flush().await
}

/// Reads one frame written by [`write_frame`].
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("peer announced a frame of {len} bytes"),
        ));
    }

    // grows with the bytes received
    let mut payload = Vec::with_capacity(len.min(CHUNK_SIZE));
    let mut chunk = [0u8; CHUNK_SIZE];
    while payload.len() < len {
        let want = (len - payload.len()).min(CHUNK_SIZE);
        reader.read_exact(&mut chunk[..want]).await?;
        payload.extend_from_slice(&chunk[..want]);
    }
    Ok(payload)
}
