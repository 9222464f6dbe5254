use std::{borrow::Cow, io};

use crate::{Deserialize, Serialize};

type Kind = u32;
const KIND_SIZE: usize = size_of::<Kind>();

const ERR: Kind = 0;
const CONTROL: Kind = 1;
const CONTRIBUTION: Kind = 2;
const RESULT: Kind = 3;

/// The control plane commands exchanged during rendezvous and teardown.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Join { rank: usize, world_size: usize },
    Welcome,
    Leave,
    Disconnect,
}

/// The operation a collective call performs over the contributions of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Sum,
    Avg,
    Max,
    Min,
    /// Every member receives the contribution of the member with rank `root`.
    Broadcast { root: u32 },
}

impl Reduction {
    fn code(self) -> (u32, u32) {
        match self {
            Reduction::Sum => (0, 0),
            Reduction::Avg => (1, 0),
            Reduction::Max => (2, 0),
            Reduction::Min => (3, 0),
            Reduction::Broadcast { root } => (4, root),
        }
    }

    fn from_code(op: u32, root: u32) -> io::Result<Self> {
        let reduction = match op {
            0 => Reduction::Sum,
            1 => Reduction::Avg,
            2 => Reduction::Max,
            3 => Reduction::Min,
            4 => Reduction::Broadcast { root },
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Received an invalid reduction code {other}"),
                ));
            }
        };

        Ok(reduction)
    }
}

/// Identifies one collective call: which group, which call of that group and how many
/// members take part in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectiveHeader {
    pub group: u32,
    pub seq: u32,
    pub size: u32,
    pub reduction: Reduction,
}

const COLLECTIVE_HEADER_SIZE: usize = 5 * size_of::<u32>();

impl CollectiveHeader {
    fn write(&self, buf: &mut Vec<u8>) {
        let (op, root) = self.reduction.code();

        for field in [self.group, self.seq, self.size, op, root] {
            buf.extend_from_slice(&field.to_be_bytes());
        }
    }

    fn read(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < COLLECTIVE_HEADER_SIZE {
            return Msg::buf_is_too_small(buf.len(), COLLECTIVE_HEADER_SIZE);
        }

        let mut fields = buf[..COLLECTIVE_HEADER_SIZE]
            .chunks_exact(size_of::<u32>())
            .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));

        let mut next = || fields.next().unwrap_or_default();
        let (group, seq, size, op, root) = (next(), next(), next(), next(), next());

        Ok(Self {
            group,
            seq,
            size,
            reduction: Reduction::from_code(op, root)?,
        })
    }
}

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug)]
pub enum Payload<'a> {
    /// A rank's input to a collective call, sent to the hub.
    Contribution {
        header: CollectiveHeader,
        data: &'a [f32],
    },
    /// The outcome of a collective call, sent by the hub to every member.
    Result {
        header: CollectiveHeader,
        data: &'a [f32],
    },
}

/// The application layer message for the entire system.
#[derive(Debug)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// A short name of the message kind, for logs and error reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(_) => "control",
            Msg::Data(Payload::Contribution { .. }) => "data/contribution",
            Msg::Data(Payload::Result { .. }) => "data/result",
            Msg::Err(_) => "err",
        }
    }

    fn buf_is_too_small<T>(size: usize, expected: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {expected} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Kind) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid message kind {kind}"),
        ))
    }
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> Option<&'a [u8]> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR.to_be_bytes());
                Some(e.as_bytes())
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL.to_be_bytes());

                // SAFETY: `Command` derives its serialize impl and holds no maps,
                //         writing it into a vec can't fail.
                serde_json::to_writer(buf, cmd).unwrap();
                None
            }
            Msg::Data(payload) => {
                let (kind, header, data) = match payload {
                    Payload::Contribution { header, data } => (CONTRIBUTION, header, data),
                    Payload::Result { header, data } => (RESULT, header, data),
                };

                buf.extend_from_slice(&kind.to_be_bytes());
                header.write(buf);
                Some(bytemuck::cast_slice(*data))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a mut [u8]) -> io::Result<Self> {
        let buf: &'a [u8] = buf;

        if buf.len() < KIND_SIZE {
            return Self::buf_is_too_small(buf.len(), KIND_SIZE);
        }

        let (kind_buf, rest) = buf.split_at(KIND_SIZE);
        let kind = Kind::from_be_bytes([kind_buf[0], kind_buf[1], kind_buf[2], kind_buf[3]]);

        match kind {
            ERR => {
                let detail = std::str::from_utf8(rest)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

                Ok(Self::Err(Cow::Borrowed(detail)))
            }
            CONTROL => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Self::Control(cmd))
            }
            CONTRIBUTION | RESULT => {
                let header = CollectiveHeader::read(rest)?;
                let data = bytemuck::try_cast_slice(&rest[COLLECTIVE_HEADER_SIZE..])
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{e:?}")))?;

                let payload = match kind {
                    CONTRIBUTION => Payload::Contribution { header, data },
                    _ => Payload::Result { header, data },
                };

                Ok(Self::Data(payload))
            }
            other => Self::invalid_kind(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame<'a>(msg: &'a Msg<'a>) -> Vec<u32> {
        let mut head = Vec::new();
        let tail = msg.serialize(&mut head);
        head.extend_from_slice(tail.unwrap_or_default());

        let mut aligned = vec![0u32; head.len().div_ceil(4)];
        bytemuck::cast_slice_mut::<u32, u8>(&mut aligned)[..head.len()].copy_from_slice(&head);
        aligned.truncate(head.len() / 4);
        aligned
    }

    #[test]
    fn contribution_keeps_header_and_values() {
        let data = [1.5, -2.0, f32::INFINITY];
        let header = CollectiveHeader {
            group: 7,
            seq: 42,
            size: 4,
            reduction: Reduction::Broadcast { root: 3 },
        };

        let msg = Msg::Data(Payload::Contribution {
            header,
            data: &data,
        });
        let mut buf = frame(&msg);
        let bytes = bytemuck::cast_slice_mut(&mut buf);

        match Msg::deserialize(bytes).unwrap() {
            Msg::Data(Payload::Contribution { header: got, data: values }) => {
                assert_eq!(got, header);
                assert_eq!(values, &data);
            }
            other => panic!("unexpected msg {other:?}"),
        }
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut bytes = CONTRIBUTION.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0; 6]);
        assert!(Msg::deserialize(&mut bytes).is_err());
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut bytes = 9u32.to_be_bytes().to_vec();
        assert!(Msg::deserialize(&mut bytes).is_err());
    }
}
