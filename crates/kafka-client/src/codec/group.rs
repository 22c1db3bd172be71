//! The "consumer" embedded protocol carried within JoinGroup and SyncGroup.
//!
//! ```text
//! Subscription => version:i16 [topic:string] user_data:bytes
//! Assignment   => version:i16 [topic:string [partition:i32]] user_data:bytes
//! ```
//!
//! Later versions append fields, which are ignored when decoding.

use crate::{Error, Result, TopicPartition};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, BTreeSet};

pub const PROTOCOL_TYPE: &str = "consumer";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
    pub topics: Vec<String>,
    pub user_data: Option<Bytes>,
}

impl Subscription {
    pub fn new(topics: impl IntoIterator<Item = String>) -> Self {
        Self {
            topics: topics.into_iter().collect(),
            user_data: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i16(0);
        buf.put_i32(self.topics.len() as i32);
        for topic in &self.topics {
            put_string(&mut buf, topic);
        }
        put_bytes(&mut buf, self.user_data.as_deref());
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        let _version = get_i16(&mut buf)?;
        let count = get_len(&mut buf)?;

        let mut topics = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            topics.push(get_string(&mut buf)?);
        }
        let user_data = if buf.has_remaining() {
            get_bytes(&mut buf)?
        } else {
            None
        };

        Ok(Self { topics, user_data })
    }
}

/// Partitions assigned to one member, by topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    pub partitions: BTreeMap<String, Vec<i32>>,
    pub user_data: Option<Bytes>,
}

impl Assignment {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i16(0);
        buf.put_i32(self.partitions.len() as i32);
        for (topic, partitions) in &self.partitions {
            put_string(&mut buf, topic);
            buf.put_i32(partitions.len() as i32);
            for partition in partitions {
                buf.put_i32(*partition);
            }
        }
        put_bytes(&mut buf, self.user_data.as_deref());
        buf.freeze()
    }

    /// Decode an assignment. An empty buffer is an empty assignment,
    /// which the coordinator sends to members that received no partitions.
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.is_empty() {
            return Ok(Self::default());
        }
        let _version = get_i16(&mut buf)?;
        let count = get_len(&mut buf)?;

        let mut partitions = BTreeMap::new();
        for _ in 0..count {
            let topic = get_string(&mut buf)?;
            let n = get_len(&mut buf)?;
            if buf.remaining() < n * 4 {
                return Err(corrupt("truncated assignment partitions"));
            }
            let parts: Vec<i32> = (0..n).map(|_| buf.get_i32()).collect();
            partitions.entry(topic).or_insert_with(Vec::new).extend(parts);
        }
        let user_data = if buf.has_remaining() {
            get_bytes(&mut buf)?
        } else {
            None
        };

        Ok(Self {
            partitions,
            user_data,
        })
    }

    pub fn topic_partitions(&self) -> BTreeSet<TopicPartition> {
        self.partitions
            .iter()
            .flat_map(|(topic, parts)| parts.iter().map(|p| TopicPartition::new(topic.clone(), *p)))
            .collect()
    }
}

fn corrupt(msg: &str) -> Error {
    Error::CorruptMessage(format!("consumer protocol: {msg}"))
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i16(s.len() as i16);
    buf.extend_from_slice(s.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, b: Option<&[u8]>) {
    match b {
        Some(b) => {
            buf.put_i32(b.len() as i32);
            buf.extend_from_slice(b);
        }
        None => buf.put_i32(-1),
    }
}

fn get_i16(buf: &mut Bytes) -> Result<i16> {
    if buf.remaining() < 2 {
        return Err(corrupt("truncated i16"));
    }
    Ok(buf.get_i16())
}

fn get_len(buf: &mut Bytes) -> Result<usize> {
    if buf.remaining() < 4 {
        return Err(corrupt("truncated array length"));
    }
    let len = buf.get_i32();
    usize::try_from(len).map_err(|_| corrupt(&format!("invalid array length {len}")))
}

fn get_string(buf: &mut Bytes) -> Result<String> {
    let len = get_i16(buf)?;
    let len = usize::try_from(len).map_err(|_| corrupt("null string"))?;
    if buf.remaining() < len {
        return Err(corrupt("truncated string"));
    }
    String::from_utf8(buf.split_to(len).to_vec()).map_err(|_| corrupt("string is not UTF-8"))
}

fn get_bytes(buf: &mut Bytes) -> Result<Option<Bytes>> {
    if buf.remaining() < 4 {
        return Err(corrupt("truncated bytes length"));
    }
    let len = buf.get_i32();
    if len < 0 {
        return Ok(None);
    }
    if buf.remaining() < len as usize {
        return Err(corrupt("truncated bytes"));
    }
    Ok(Some(buf.split_to(len as usize)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_wire_format() {
        let sub = Subscription::new(["orders".to_string(), "users".to_string()]);
        let encoded = sub.encode();

        assert_eq!(
            &encoded[..],
            b"\x00\x00\x00\x00\x00\x02\x00\x06orders\x00\x05users\xff\xff\xff\xff"
        );
        assert_eq!(Subscription::decode(encoded).unwrap(), sub);
    }

    #[test]
    fn test_subscription_with_later_version_fields() {
        // A v1 subscription, as sent by newer clients, with owned partitions.
        let mut buf = BytesMut::new();
        buf.put_i16(1);
        buf.put_i32(1);
        put_string(&mut buf, "orders");
        put_bytes(&mut buf, Some(b"ud"));
        buf.put_i32(0); // Owned partitions.

        let sub = Subscription::decode(buf.freeze()).unwrap();
        assert_eq!(sub.topics, vec!["orders".to_string()]);
        assert_eq!(sub.user_data.as_deref(), Some(&b"ud"[..]));
    }

    #[test]
    fn test_assignment() {
        let assignment = Assignment {
            partitions: [("a".to_string(), vec![0, 2]), ("b".to_string(), vec![1])]
                .into_iter()
                .collect(),
            user_data: None,
        };
        let decoded = Assignment::decode(assignment.encode()).unwrap();
        assert_eq!(decoded, assignment);

        assert_eq!(
            decoded.topic_partitions().into_iter().collect::<Vec<_>>(),
            vec![
                TopicPartition::new("a", 0),
                TopicPartition::new("a", 2),
                TopicPartition::new("b", 1),
            ]
        );
        assert_eq!(Assignment::decode(Bytes::new()).unwrap(), Assignment::default());
    }

    #[test]
    fn test_truncated_is_corrupt() {
        let encoded = Subscription::new(["orders".to_string()]).encode();
        for len in [1, 5, 9] {
            assert!(matches!(
                Subscription::decode(encoded.slice(..len)),
                Err(Error::CorruptMessage(_))
            ));
        }
    }
}
