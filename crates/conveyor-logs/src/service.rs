//! Log service: descriptor lifecycle plus the write/read entry points.

use futures::{Stream, StreamExt};
use std::sync::Arc;
use tracing::info;

use conveyor_core::event::{EventSink, NewQueueEvent, QueueEventKind};
use conveyor_core::log::{LogDescriptor, LogEntry};
use conveyor_core::store::BlobStore;
use conveyor_core::{ETAG_ANY, Error, ResourceId, Result};
use conveyor_db::LogRepo;

use crate::reader::{LogReader, ReadOptions};
use crate::writer::{LogWriter, LogWriterConfig};

pub struct LogService {
    store: Arc<dyn LogRepo>,
    blobs: Arc<dyn BlobStore>,
    events: Arc<dyn EventSink>,
    writer_config: LogWriterConfig,
}

impl LogService {
    pub fn new(
        store: Arc<dyn LogRepo>,
        blobs: Arc<dyn BlobStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            blobs,
            events,
            writer_config: LogWriterConfig::default(),
        }
    }

    pub fn with_writer_config(mut self, config: LogWriterConfig) -> Self {
        self.writer_config = config;
        self
    }

    /// Create a descriptor for `subject_id`, parented into the build's
    /// descriptor tree.
    pub async fn open_log(
        &self,
        subject_id: ResourceId,
        parent_id: Option<ResourceId>,
    ) -> Result<LogDescriptor> {
        let descriptor = LogDescriptor::new(subject_id, parent_id);
        self.store.insert_descriptor(&descriptor).await?;
        Ok(descriptor)
    }

    pub async fn descriptor(&self, log_id: ResourceId) -> Result<LogDescriptor> {
        Ok(self.store.get_descriptor(log_id).await?)
    }

    pub async fn descriptor_for_subject(
        &self,
        subject_id: ResourceId,
    ) -> Result<Option<LogDescriptor>> {
        Ok(self.store.descriptor_for_subject(subject_id).await?)
    }

    /// A writer over the descriptor. Fails with `log-closed` once sealed.
    pub async fn open_writer(&self, log_id: ResourceId) -> Result<LogWriter> {
        let descriptor = self.store.get_descriptor(log_id).await?;
        LogWriter::new(self.blobs.clone(), &descriptor, self.writer_config.clone())
    }

    /// Consume framed entry batches until the stream ends, then flush and
    /// account the written bytes on the descriptor.
    pub async fn write_data<S>(&self, log_id: ResourceId, mut frames: S) -> Result<()>
    where
        S: Stream<Item = Result<Vec<LogEntry>>> + Unpin,
    {
        let mut writer = self.open_writer(log_id).await?;
        while let Some(batch) = frames.next().await {
            writer.write(batch?).await?;
        }
        writer.flush().await?;

        if writer.bytes_written() > 0 {
            let mut descriptor = self.store.get_descriptor(log_id).await?;
            descriptor.size += writer.bytes_written();
            // Size accounting is a server-internal refresh.
            self.store
                .update_descriptor(&descriptor, ETAG_ANY)
                .await?;
        }
        Ok(())
    }

    /// Seal the descriptor and announce it on the build's event stream.
    /// Sealing an already-sealed descriptor returns it unchanged.
    pub async fn seal(&self, log_id: ResourceId) -> Result<LogDescriptor> {
        let mut descriptor = self.store.get_descriptor(log_id).await?;
        if descriptor.sealed {
            return Ok(descriptor);
        }
        descriptor.sealed = true;
        let etag = descriptor.etag;
        let sealed = self.store.update_descriptor(&descriptor, etag).await?;
        info!(log_id = %log_id, "sealed log");

        let build_id = self.root_subject(&sealed).await?;
        self.events
            .publish(NewQueueEvent::new(
                build_id,
                QueueEventKind::LogSealed,
                sealed.id,
            ))
            .await?;
        Ok(sealed)
    }

    /// A reader over the descriptor, optionally expanded to its subtree.
    pub async fn open_reader(&self, log_id: ResourceId, opts: &ReadOptions) -> Result<LogReader> {
        let root = self.store.get_descriptor(log_id).await?;
        let mut descriptors = vec![root];
        if opts.expand {
            let mut frontier = vec![log_id];
            while let Some(next) = frontier.pop() {
                for child in self.store.children_of(next).await? {
                    frontier.push(child.id);
                    descriptors.push(child);
                }
            }
        }
        LogReader::new(self.blobs.clone(), descriptors, opts.start_seq)
    }

    /// Walk parents to the root descriptor; its subject is the build.
    async fn root_subject(&self, descriptor: &LogDescriptor) -> Result<ResourceId> {
        let mut current = descriptor.clone();
        let mut hops = 0;
        while let Some(parent_id) = current.parent_id {
            current = self.store.get_descriptor(parent_id).await?;
            hops += 1;
            if hops > 16 {
                return Err(Error::ValidationFailed(
                    "log descriptor tree too deep".to_string(),
                ));
            }
        }
        Ok(current.subject_id)
    }
}
