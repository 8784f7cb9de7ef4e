use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

/// Lifecycle checkpoint of a job run, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    RequestAvailableChannels,
    ReplyAvailableChannels,
    RequestNewChannel,
    ReplyNewChannel,
    ResolvedChannel,
    RequestChannelState,
    ReplyChannelState,
    CheckedChannelValidity,
    RequestChannelExtendAndAddFunds,
    ReplyChannelExtendAndAddFunds,
    RequestChannelAddFunds,
    ReplyChannelAddFunds,
    RequestChannelExtendExpiration,
    ReplyChannelExtendExpiration,
    RequestSvcCall,
    ReplySvcCall,
    Stats,
}

impl JobStage {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestAvailableChannels => "request_available_channels",
            Self::ReplyAvailableChannels => "reply_available_channels",
            Self::RequestNewChannel => "request_new_channel",
            Self::ReplyNewChannel => "reply_new_channel",
            Self::ResolvedChannel => "resolved_channel",
            Self::RequestChannelState => "request_channel_state",
            Self::ReplyChannelState => "reply_channel_state",
            Self::CheckedChannelValidity => "checked_channel_validity",
            Self::RequestChannelExtendAndAddFunds => "request_channel_extend_and_add_funds",
            Self::ReplyChannelExtendAndAddFunds => "reply_channel_extend_and_add_funds",
            Self::RequestChannelAddFunds => "request_channel_add_funds",
            Self::ReplyChannelAddFunds => "reply_channel_add_funds",
            Self::RequestChannelExtendExpiration => "request_channel_extend_expiration",
            Self::ReplyChannelExtendExpiration => "reply_channel_extend_expiration",
            Self::RequestSvcCall => "request_svc_call",
            Self::ReplySvcCall => "reply_svc_call",
            Self::Stats => "stats",
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub seq: u64,
    pub stage: JobStage,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

/// Append-only record of one job run.
///
/// An optional observer receives each event as it is appended. Observers that
/// went away are ignored.
#[derive(Debug, Default)]
pub struct JobEventLog {
    events: Vec<JobEvent>,
    observer: Option<UnboundedSender<JobEvent>>,
}

impl JobEventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_observer(observer: UnboundedSender<JobEvent>) -> Self {
        Self {
            events: Vec::new(),
            observer: Some(observer),
        }
    }

    pub fn emit(&mut self, stage: JobStage, payload: Value) {
        let event = JobEvent {
            seq: self.events.len() as u64,
            stage,
            payload,
            at: Utc::now(),
        };
        tracing::debug!(stage = stage.as_str(), seq = event.seq, "job event");
        if let Some(observer) = &self.observer
            && observer.send(event.clone()).is_err()
        {
            self.observer = None;
        }
        self.events.push(event);
    }

    #[must_use]
    pub fn events(&self) -> &[JobEvent] {
        &self.events
    }

    #[must_use]
    pub fn stages(&self) -> Vec<JobStage> {
        self.events.iter().map(|event| event.stage).collect()
    }

    #[must_use]
    pub fn last(&self, stage: JobStage) -> Option<&JobEvent> {
        self.events.iter().rev().find(|event| event.stage == stage)
    }

    #[must_use]
    pub fn into_events(self) -> Vec<JobEvent> {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::{JobEventLog, JobStage};

    #[test]
    fn events_are_sequenced_in_emission_order() {
        let mut log = JobEventLog::new();
        log.emit(JobStage::RequestAvailableChannels, json!({}));
        log.emit(JobStage::ReplyAvailableChannels, json!({ "channels": [] }));
        log.emit(JobStage::Stats, json!({ "total_tx": 0 }));

        let seqs: Vec<u64> = log.events().iter().map(|event| event.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(
            log.stages(),
            vec![
                JobStage::RequestAvailableChannels,
                JobStage::ReplyAvailableChannels,
                JobStage::Stats,
            ]
        );
        assert_eq!(
            log.last(JobStage::Stats).map(|event| event.payload.clone()),
            Some(json!({ "total_tx": 0 }))
        );
    }

    #[test]
    fn stage_names_serialize_snake_case() -> Result<(), serde_json::Error> {
        assert_eq!(
            serde_json::to_value(JobStage::RequestChannelExtendAndAddFunds)?,
            json!("request_channel_extend_and_add_funds")
        );
        assert_eq!(JobStage::ReplySvcCall.to_string(), "reply_svc_call");
        Ok(())
    }

    #[test]
    fn observer_sees_every_event_and_dropped_observer_is_ignored() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut log = JobEventLog::with_observer(sender);
        log.emit(JobStage::ResolvedChannel, json!({ "channel_id": 3 }));
        let received = receiver.try_recv();
        assert!(matches!(received, Ok(event) if event.stage == JobStage::ResolvedChannel));

        drop(receiver);
        log.emit(JobStage::Stats, json!({}));
        assert_eq!(log.events().len(), 2);
    }
}
