//! The broker: a root directory holding one subdirectory per topic, and the
//! in-memory map from topic name to loaded [`Topic`] that routes publish and
//! subscribe calls to it.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use futures::Stream;
use log::info;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    cursor,
    error::{BrokerError, SubscribeError},
    topic::Topic,
    BrokerOptions,
};

struct Inner {
    root: PathBuf,
    options: BrokerOptions,
    topics: Mutex<HashMap<String, Topic>>,
}

/// A cheaply-clonable handle to an open broker.
///
/// A [`Topic`] is created on first [`Self::publish`] to a new name, or loaded
/// from disk at [`Self::open`]. Lookup and creation are serialized by a
/// broker-wide lock that is released before any per-topic work (appending, or
/// building a subscription) begins, so a slow publish on one topic never
/// blocks a lookup for another.
#[derive(Clone)]
pub struct Broker(Arc<Inner>);

impl Broker {
    /// Open a broker rooted at `root`, creating the directory if it doesn't
    /// exist, and eagerly loading every existing topic subdirectory.
    ///
    /// Any other entries directly under `root` (files, or directories that
    /// fail to validate as a topic) are a hard error: an unreadable topic is
    /// not silently skipped.
    pub fn open(root: impl AsRef<Path>, options: BrokerOptions) -> Result<Self, BrokerError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let mut topics = HashMap::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let topic = Topic::open(name.clone(), entry.path(), options)?;
            topics.insert(name, topic);
        }
        info!("opened broker at {}: {} topic(s)", root.display(), topics.len());

        Ok(Self(Arc::new(Inner {
            root,
            options,
            topics: Mutex::new(topics),
        })))
    }

    /// Append `messages` to `topic` in order, creating the topic if this is
    /// the first publish to that name. Returns the offsets assigned, one per
    /// message, in the same order they were given.
    pub async fn publish(&self, topic: &str, messages: Vec<Bytes>) -> Result<Vec<u64>, BrokerError> {
        let handle = self.get_or_create(topic).await?;
        Ok(handle.append(messages).await?)
    }

    /// Stream decoded messages from `topic` starting at `start_offset`.
    ///
    /// Resolves the topic and validates `start_offset` eagerly, before
    /// returning: an unknown topic or an out-of-range offset is reported as
    /// an error from this call, not as the stream's first item. The returned
    /// stream tails the topic's growth and follows segment rotation until
    /// `cancel` fires.
    pub async fn subscribe(
        &self,
        topic: &str,
        start_offset: u64,
        cancel: CancellationToken,
    ) -> Result<impl Stream<Item = Result<Bytes, SubscribeError>>, BrokerError> {
        let handle = self
            .lookup(topic)
            .await
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_owned()))?;
        let segment = handle.segment_for_offset(start_offset).await?;
        Ok(cursor::stream(handle, segment, start_offset, cancel))
    }

    async fn lookup(&self, topic: &str) -> Option<Topic> {
        let topics = self.0.topics.lock().await;
        topics.get(topic).cloned()
    }

    async fn get_or_create(&self, topic: &str) -> Result<Topic, BrokerError> {
        let mut topics = self.0.topics.lock().await;
        if let Some(handle) = topics.get(topic) {
            return Ok(handle.clone());
        }
        let dir = self.0.root.join(topic);
        let handle = Topic::create(topic.to_owned(), dir, self.0.options)?;
        topics.insert(topic.to_owned(), handle.clone());
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tempfile::tempdir;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn publish_then_subscribe_from_zero() {
        let dir = tempdir().unwrap();
        let broker = Broker::open(dir.path(), BrokerOptions::default()).unwrap();

        broker
            .publish("t", vec![Bytes::from_static(b"a"), Bytes::from_static(b"b"), Bytes::from_static(b"c")])
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let mut stream = Box::pin(broker.subscribe("t", 0, cancel.clone()).await.unwrap());

        for expected in [&b"a"[..], b"b", b"c"] {
            let msg = tokio::time::timeout(std::time::Duration::from_millis(200), stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(&msg[..], expected);
        }
        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscribe_from_middle_offset() {
        let dir = tempdir().unwrap();
        let broker = Broker::open(dir.path(), BrokerOptions::default()).unwrap();
        broker
            .publish("t", vec![Bytes::from_static(b"a"), Bytes::from_static(b"b"), Bytes::from_static(b"c")])
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let mut stream = Box::pin(broker.subscribe("t", 2, cancel.clone()).await.unwrap());
        let msg = tokio::time::timeout(std::time::Duration::from_millis(200), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&msg[..], b"c");
        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscribe_unknown_topic_is_an_error() {
        let dir = tempdir().unwrap();
        let broker = Broker::open(dir.path(), BrokerOptions::default()).unwrap();
        let err = broker.subscribe("nope", 0, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownTopic(name) if name == "nope"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscribe_out_of_range_offset_is_an_error() {
        let dir = tempdir().unwrap();
        let broker = Broker::open(dir.path(), BrokerOptions::default()).unwrap();
        broker.publish("t", vec![Bytes::from_static(b"a")]).await.unwrap();

        let err = broker.subscribe("t", 5, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BrokerError::Topic(crate::error::TopicError::BadOffset { offset: 5, .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn live_tail_sees_a_publish_after_subscribing() {
        let dir = tempdir().unwrap();
        let broker = Broker::open(dir.path(), BrokerOptions::default()).unwrap();

        let cancel = CancellationToken::new();
        let mut stream = Box::pin(broker.subscribe("t", 0, cancel.clone()).await.unwrap());

        let broker2 = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            broker2.publish("t", vec![Bytes::from_static(b"x")]).await.unwrap();
        });

        let msg = tokio::time::timeout(std::time::Duration::from_millis(500), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&msg[..], b"x");
        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_preserves_messages_and_extends_offsets() {
        let dir = tempdir().unwrap();
        {
            let broker = Broker::open(dir.path(), BrokerOptions::default()).unwrap();
            broker
                .publish("t", vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")])
                .await
                .unwrap();
        }

        let broker = Broker::open(dir.path(), BrokerOptions::default()).unwrap();
        let cancel = CancellationToken::new();
        let mut stream = Box::pin(broker.subscribe("t", 0, cancel.clone()).await.unwrap());
        for expected in [&b"a"[..], b"b"] {
            let msg = tokio::time::timeout(std::time::Duration::from_millis(200), stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(&msg[..], expected);
        }

        let offsets = broker.publish("t", vec![Bytes::from_static(b"c")]).await.unwrap();
        assert_eq!(offsets, vec![2]);
        cancel.cancel();
    }
}
