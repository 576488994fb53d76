use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::SqsError;
use crate::types::MessageAttributeValue;

pub const MAXIMUM_MESSAGE_LENGTH: usize = 262_144;
pub const MAXIMUM_VISIBILITY_TIMEOUT: i64 = 43_200;
pub const MAXIMUM_DELAY_SECONDS: i64 = 900;
pub const MAXIMUM_BATCH_SIZE: usize = 10;
pub const DEDUPLICATION_WINDOW_SECONDS: i64 = 300;

const DEFAULT_VISIBILITY_TIMEOUT: i64 = 30;
const DEFAULT_RETENTION_PERIOD: i64 = 345_600; // 4 days
const MINIMUM_RETENTION_PERIOD: i64 = 60;
const MAXIMUM_RETENTION_PERIOD: i64 = 1_209_600; // 14 days

/// A message and its delivery state. Immutable payload fields are set on send;
/// the lease fields (`receipt_handle`, `visible_at`, `receive_count`) change as
/// the message moves between the backlog and the in-flight map.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub body: String,
    pub md5_of_body: String,
    pub md5_of_attributes: Option<String>,
    pub attributes: BTreeMap<String, MessageAttributeValue>,
    pub system_attributes: BTreeMap<String, MessageAttributeValue>,
    pub group_id: Option<String>,
    pub dedup_id: Option<String>,
    pub sequence_number: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub delay_until: DateTime<Utc>,
    pub receive_count: u32,
    pub first_received_at: Option<DateTime<Utc>>,
    pub receipt_handle: Option<String>,
    pub visible_at: Option<DateTime<Utc>>,
}

impl Message {
    fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.delay_until <= now
    }

    fn release_lease(&mut self) {
        self.receipt_handle = None;
        self.visible_at = None;
    }
}

/// Recently seen deduplication keys for a FIFO queue. A key maps to the message
/// it originally produced and stays effective for five minutes from first
/// insertion.
#[derive(Debug, Default)]
pub struct DeduplicationWindow {
    entries: HashMap<String, DedupEntry>,
}

#[derive(Debug)]
struct DedupEntry {
    message_id: String,
    sequence_number: Option<String>,
    expires_at: DateTime<Utc>,
}

impl DeduplicationWindow {
    /// Returns the original (message id, sequence number) if `key` is still
    /// within its window. Expired entries are dropped on the way.
    pub fn lookup(&mut self, key: &str, now: DateTime<Utc>) -> Option<(String, Option<String>)> {
        self.entries.retain(|_, e| e.expires_at > now);
        self.entries
            .get(key)
            .map(|e| (e.message_id.clone(), e.sequence_number.clone()))
    }

    pub fn record(
        &mut self,
        key: String,
        message_id: String,
        sequence_number: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.entries.insert(
            key,
            DedupEntry {
                message_id,
                sequence_number,
                expires_at: now + Duration::seconds(DEDUPLICATION_WINDOW_SECONDS),
            },
        );
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Group-ordering guard for FIFO queues: while a group is locked one of its
/// messages is in flight and no further message from it may be handed out.
#[derive(Debug, Default)]
pub struct GroupSequencer {
    locked: HashSet<String>,
}

impl GroupSequencer {
    pub fn is_locked(&self, group: &str) -> bool {
        self.locked.contains(group)
    }

    pub fn lock(&mut self, group: &str) {
        self.locked.insert(group.to_string());
    }

    pub fn unlock(&mut self, group: &str) {
        self.locked.remove(group);
    }

    pub fn clear(&mut self) {
        self.locked.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedrivePolicy {
    pub dead_letter_target_arn: String,
    #[serde(deserialize_with = "max_receive_count")]
    pub max_receive_count: u32,
}

// The AWS API accepts maxReceiveCount both as a JSON number and as a numeric
// string.
fn max_receive_count<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n
            .as_u64()
            .map(|n| n as u32)
            .ok_or_else(|| serde::de::Error::custom("maxReceiveCount must be a positive integer")),
        serde_json::Value::String(s) => s
            .parse()
            .map_err(|_| serde::de::Error::custom("maxReceiveCount must be a positive integer")),
        _ => Err(serde::de::Error::custom(
            "maxReceiveCount must be a positive integer",
        )),
    }
}

impl RedrivePolicy {
    pub fn parse(raw: &str) -> Result<Self, SqsError> {
        serde_json::from_str(raw).map_err(|e| {
            SqsError::InvalidParameterValue(format!(
                "Value {raw} for parameter RedrivePolicy is invalid. Reason: {e}."
            ))
        })
    }
}

#[derive(Debug, Clone)]
pub struct Permission {
    pub aws_account_ids: Vec<String>,
    pub actions: Vec<String>,
}

/// Result of a successful (or deduplicated) send.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message_id: String,
    pub md5_of_message_body: String,
    pub md5_of_message_attributes: Option<String>,
    pub sequence_number: Option<String>,
    pub deduplicated: bool,
}

/// What the lazy sweep did: `released` messages went back to the backlog,
/// `dead_letters` exhausted their redrive allowance and must be delivered to
/// the dead-letter queue by the caller.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub released: usize,
    pub dead_letters: Vec<Message>,
}

#[derive(Debug)]
pub struct Queue {
    pub name: String,
    pub arn: String,
    pub url: String,
    pub is_fifo: bool,
    pub content_based_dedup: bool,
    pub visibility_timeout: i64,
    pub message_retention_period: i64,
    pub delay_seconds: i64,
    pub maximum_message_size: usize,
    pub receive_message_wait_time_seconds: i64,
    pub redrive_policy: Option<RedrivePolicy>,
    pub redrive_policy_raw: Option<String>,
    pub policy: Option<String>,
    pub tags: HashMap<String, String>,
    pub permissions: HashMap<String, Permission>,
    pub created_at: DateTime<Utc>,
    backlog: VecDeque<Message>,
    in_flight: HashMap<String, Message>,
    dedup_window: DeduplicationWindow,
    groups: GroupSequencer,
    sequence_counter: u64,
}

impl Queue {
    pub fn new(name: &str, arn: String, url: String, now: DateTime<Utc>) -> Self {
        Queue {
            is_fifo: name.ends_with(".fifo"),
            name: name.to_string(),
            arn,
            url,
            content_based_dedup: false,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            message_retention_period: DEFAULT_RETENTION_PERIOD,
            delay_seconds: 0,
            maximum_message_size: MAXIMUM_MESSAGE_LENGTH,
            receive_message_wait_time_seconds: 0,
            redrive_policy: None,
            redrive_policy_raw: None,
            policy: None,
            tags: HashMap::new(),
            permissions: HashMap::new(),
            created_at: now,
            backlog: VecDeque::new(),
            in_flight: HashMap::new(),
            dedup_window: DeduplicationWindow::default(),
            groups: GroupSequencer::default(),
            sequence_counter: 0,
        }
    }

    // --- Send ---

    pub fn send(
        &mut self,
        body: String,
        attributes: BTreeMap<String, MessageAttributeValue>,
        system_attributes: BTreeMap<String, MessageAttributeValue>,
        delay_seconds: Option<i64>,
        group_id: Option<String>,
        dedup_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<SendOutcome, SqsError> {
        if body.len() > self.maximum_message_size {
            return Err(SqsError::InvalidParameterValue(format!(
                "One or more parameters are invalid. Reason: Message must be shorter than {} bytes.",
                self.maximum_message_size
            )));
        }

        if let Some(delay) = delay_seconds {
            if !(0..=MAXIMUM_DELAY_SECONDS).contains(&delay) {
                return Err(SqsError::InvalidParameterValue(format!(
                    "Value {delay} for parameter DelaySeconds is invalid. Reason: DelaySeconds must be >= 0 and <= 900."
                )));
            }
            if self.is_fifo {
                return Err(SqsError::InvalidParameterValue(format!(
                    "Value {delay} for parameter DelaySeconds is invalid. Reason: The request includes a parameter that is not valid for this queue type."
                )));
            }
        }

        let md5_of_message_body = md5_hex(body.as_bytes());
        let md5_of_message_attributes = attribute_md5(&attributes);

        let mut dedup_key = None;
        if self.is_fifo {
            if group_id.is_none() {
                return Err(SqsError::MissingParameter(
                    "The request must contain the parameter MessageGroupId.".into(),
                ));
            }
            let key = match (&dedup_id, self.content_based_dedup) {
                (Some(id), _) => id.clone(),
                (None, true) => content_dedup_key(&body, &attributes),
                (None, false) => {
                    return Err(SqsError::InvalidParameterValue(
                        "The queue should either have ContentBasedDeduplication enabled or MessageDeduplicationId provided explicitly".into(),
                    ));
                }
            };
            if let Some((message_id, sequence_number)) = self.dedup_window.lookup(&key, now) {
                // Idempotent resend: the payload is identical, so the
                // checksums of the incoming request match the original's.
                return Ok(SendOutcome {
                    message_id,
                    md5_of_message_body,
                    md5_of_message_attributes,
                    sequence_number,
                    deduplicated: true,
                });
            }
            dedup_key = Some(key);
        }

        let sequence_number = if self.is_fifo {
            self.sequence_counter += 1;
            Some(format!("{:020}", self.sequence_counter))
        } else {
            None
        };

        let delay = delay_seconds.unwrap_or(self.delay_seconds);
        let message = Message {
            id: Uuid::new_v4().to_string(),
            body,
            md5_of_body: md5_of_message_body.clone(),
            md5_of_attributes: md5_of_message_attributes.clone(),
            attributes,
            system_attributes,
            group_id,
            dedup_id,
            sequence_number: sequence_number.clone(),
            sent_at: now,
            delay_until: now + Duration::seconds(delay),
            receive_count: 0,
            first_received_at: None,
            receipt_handle: None,
            visible_at: None,
        };

        let outcome = SendOutcome {
            message_id: message.id.clone(),
            md5_of_message_body,
            md5_of_message_attributes,
            sequence_number: sequence_number.clone(),
            deduplicated: false,
        };

        if let Some(key) = dedup_key {
            self.dedup_window
                .record(key, message.id.clone(), sequence_number, now);
        }
        self.backlog.push_back(message);
        Ok(outcome)
    }

    // --- Receive ---

    /// Hands out up to `count` eligible messages, moving each into the
    /// in-flight map under a fresh receipt handle. FIFO queues hand out at
    /// most one message per group: selecting a message locks its group, and
    /// locked groups are skipped for the rest of the scan.
    pub fn receive(
        &mut self,
        count: usize,
        visibility_timeout: i64,
        now: DateTime<Utc>,
    ) -> Vec<Message> {
        let mut received = Vec::new();
        let mut i = 0;
        while i < self.backlog.len() && received.len() < count {
            let eligible = {
                let msg = &self.backlog[i];
                msg.is_eligible(now)
                    && !matches!(&msg.group_id, Some(g) if self.is_fifo && self.groups.is_locked(g))
            };
            if !eligible {
                i += 1;
                continue;
            }

            let mut msg = self.backlog.remove(i).expect("index in bounds");
            let handle = Uuid::new_v4().to_string();
            msg.receipt_handle = Some(handle.clone());
            msg.visible_at = Some(now + Duration::seconds(visibility_timeout));
            msg.receive_count += 1;
            if msg.first_received_at.is_none() {
                msg.first_received_at = Some(now);
            }
            if self.is_fifo {
                if let Some(group) = &msg.group_id {
                    self.groups.lock(group);
                }
            }
            received.push(msg.clone());
            self.in_flight.insert(handle, msg);
        }
        received
    }

    // --- Visibility ---

    pub fn change_visibility(
        &mut self,
        receipt_handle: &str,
        visibility_timeout: i64,
        now: DateTime<Utc>,
    ) -> Result<(), SqsError> {
        match self.in_flight.get_mut(receipt_handle) {
            Some(msg) => {
                // A timeout of 0 expires the lease; the next sweep returns the
                // message to the backlog.
                msg.visible_at = Some(now + Duration::seconds(visibility_timeout));
                Ok(())
            }
            None => Err(SqsError::ReceiptHandleIsInvalid(receipt_handle.to_string())),
        }
    }

    // --- Delete ---

    /// Removes the leased message permanently. Returns false when the handle
    /// no longer refers to a live lease (delete is idempotent).
    pub fn delete(&mut self, receipt_handle: &str) -> bool {
        match self.in_flight.remove(receipt_handle) {
            Some(msg) => {
                if self.is_fifo {
                    if let Some(group) = &msg.group_id {
                        self.groups.unlock(group);
                    }
                }
                true
            }
            None => false,
        }
    }

    pub fn purge(&mut self) {
        self.backlog.clear();
        self.in_flight.clear();
        self.dedup_window.clear();
        self.groups.clear();
    }

    // --- Lazy sweep ---

    /// Expires lapsed leases and drops retention-expired backlog messages.
    /// Lapsed messages whose receive count reached the redrive allowance are
    /// handed back for dead-letter delivery instead of re-entering the
    /// backlog; the caller owns the DLQ hand-off (no second queue lock here).
    pub fn reconcile(&mut self, now: DateTime<Utc>) -> ReconcileOutcome {
        let retention = Duration::seconds(self.message_retention_period);
        self.backlog.retain(|m| m.sent_at + retention > now);

        let lapsed: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, m)| matches!(m.visible_at, Some(t) if t <= now))
            .map(|(h, _)| h.clone())
            .collect();

        let mut outcome = ReconcileOutcome::default();
        for handle in lapsed {
            let mut msg = self.in_flight.remove(&handle).expect("handle present");
            if self.is_fifo {
                if let Some(group) = &msg.group_id {
                    self.groups.unlock(group);
                }
            }
            msg.release_lease();
            let exhausted = matches!(&self.redrive_policy, Some(rp) if msg.receive_count >= rp.max_receive_count);
            if exhausted {
                outcome.dead_letters.push(msg);
            } else {
                self.reinsert(msg);
                outcome.released += 1;
            }
        }
        outcome
    }

    /// Returns a message to the backlog after its lease lapsed. FIFO queues
    /// restore send order by sequence number; standard queues put it in front.
    fn reinsert(&mut self, msg: Message) {
        if self.is_fifo {
            let pos = self
                .backlog
                .iter()
                .position(|m| m.sequence_number > msg.sequence_number)
                .unwrap_or(self.backlog.len());
            self.backlog.insert(pos, msg);
        } else {
            self.backlog.push_front(msg);
        }
    }

    /// Accepts a dead-lettered message from a source queue.
    pub fn accept_dead_letter(&mut self, mut msg: Message) {
        msg.receive_count = 0;
        msg.release_lease();
        self.backlog.push_back(msg);
    }

    /// Earliest instant at which a currently ineligible message may become
    /// eligible (a delay elapsing or an in-flight lease lapsing). Long polls
    /// sleep no longer than this.
    pub fn next_wakeup(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let delays = self
            .backlog
            .iter()
            .filter(|m| m.delay_until > now)
            .map(|m| m.delay_until);
        let leases = self.in_flight.values().filter_map(|m| m.visible_at);
        delays.chain(leases).min()
    }

    // --- Attributes ---

    pub fn set_attribute(&mut self, name: &str, value: &str) -> Result<(), SqsError> {
        match name {
            "DelaySeconds" => {
                self.delay_seconds = parse_ranged(name, value, 0, MAXIMUM_DELAY_SECONDS)?;
            }
            "MaximumMessageSize" => {
                self.maximum_message_size =
                    parse_ranged(name, value, 1024, MAXIMUM_MESSAGE_LENGTH as i64)? as usize;
            }
            "MessageRetentionPeriod" => {
                self.message_retention_period =
                    parse_ranged(name, value, MINIMUM_RETENTION_PERIOD, MAXIMUM_RETENTION_PERIOD)?;
            }
            "ReceiveMessageWaitTimeSeconds" => {
                self.receive_message_wait_time_seconds = parse_ranged(name, value, 0, 20)?;
            }
            "VisibilityTimeout" => {
                self.visibility_timeout =
                    parse_ranged(name, value, 0, MAXIMUM_VISIBILITY_TIMEOUT)?;
            }
            "RedrivePolicy" => {
                if value.is_empty() {
                    self.redrive_policy = None;
                    self.redrive_policy_raw = None;
                } else {
                    self.redrive_policy = Some(RedrivePolicy::parse(value)?);
                    self.redrive_policy_raw = Some(value.to_string());
                }
            }
            "Policy" => {
                self.policy = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "FifoQueue" => {
                let fifo = parse_bool(name, value)?;
                if fifo != self.is_fifo {
                    return Err(SqsError::InvalidParameterValue(format!(
                        "Value {value} for parameter FifoQueue is invalid. Reason: The queue name must end in the .fifo suffix for FIFO queues."
                    )));
                }
            }
            "ContentBasedDeduplication" => {
                self.content_based_dedup = parse_bool(name, value)?;
            }
            _ => return Err(SqsError::InvalidAttributeName(name.to_string())),
        }
        Ok(())
    }

    pub fn attributes(&self, now: DateTime<Utc>) -> HashMap<String, String> {
        let visible = self.backlog.iter().filter(|m| m.is_eligible(now)).count();
        let delayed = self.backlog.len() - visible;

        let mut attrs = HashMap::from([
            ("QueueArn".to_string(), self.arn.clone()),
            ("ApproximateNumberOfMessages".to_string(), visible.to_string()),
            (
                "ApproximateNumberOfMessagesNotVisible".to_string(),
                self.in_flight.len().to_string(),
            ),
            (
                "ApproximateNumberOfMessagesDelayed".to_string(),
                delayed.to_string(),
            ),
            (
                "CreatedTimestamp".to_string(),
                self.created_at.timestamp().to_string(),
            ),
            (
                "VisibilityTimeout".to_string(),
                self.visibility_timeout.to_string(),
            ),
            (
                "MaximumMessageSize".to_string(),
                self.maximum_message_size.to_string(),
            ),
            (
                "MessageRetentionPeriod".to_string(),
                self.message_retention_period.to_string(),
            ),
            ("DelaySeconds".to_string(), self.delay_seconds.to_string()),
            (
                "ReceiveMessageWaitTimeSeconds".to_string(),
                self.receive_message_wait_time_seconds.to_string(),
            ),
        ]);
        if let Some(raw) = &self.redrive_policy_raw {
            attrs.insert("RedrivePolicy".to_string(), raw.clone());
        }
        if let Some(policy) = &self.policy {
            attrs.insert("Policy".to_string(), policy.clone());
        }
        if self.is_fifo {
            attrs.insert("FifoQueue".to_string(), "true".to_string());
            attrs.insert(
                "ContentBasedDeduplication".to_string(),
                self.content_based_dedup.to_string(),
            );
        }
        attrs
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn has_lease(&self, receipt_handle: &str) -> bool {
        self.in_flight.contains_key(receipt_handle)
    }
}

fn parse_ranged(name: &str, value: &str, min: i64, max: i64) -> Result<i64, SqsError> {
    let invalid = || {
        SqsError::InvalidParameterValue(format!(
            "Value {value} for parameter {name} is invalid. Reason: {name} must be >= {min} and <= {max}."
        ))
    };
    let parsed: i64 = value.parse().map_err(|_| invalid())?;
    if (min..=max).contains(&parsed) {
        Ok(parsed)
    } else {
        Err(invalid())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, SqsError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(SqsError::InvalidParameterValue(format!(
            "Value {value} for parameter {name} is invalid. Reason: {name} must be true or false."
        ))),
    }
}

// --- Checksums ---

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", Md5::digest(data))
}

/// AWS message-attribute digest: attributes in name order, every element
/// preceded by a 4-byte big-endian length; string and number values carry
/// transport byte 1, binary values byte 2 with the raw (base64-decoded) bytes.
pub fn attribute_md5(
    attributes: &BTreeMap<String, MessageAttributeValue>,
) -> Option<String> {
    if attributes.is_empty() {
        return None;
    }
    let mut hasher = Md5::new();
    for (name, value) in attributes {
        update_length_prefixed(&mut hasher, name.as_bytes());
        update_length_prefixed(&mut hasher, value.data_type.as_bytes());
        if value.data_type.starts_with("Binary") {
            hasher.update([2u8]);
            let raw = value
                .binary_value
                .as_deref()
                .and_then(|b| BASE64.decode(b).ok())
                .unwrap_or_default();
            update_length_prefixed(&mut hasher, &raw);
        } else {
            hasher.update([1u8]);
            let raw = value.string_value.as_deref().unwrap_or_default();
            update_length_prefixed(&mut hasher, raw.as_bytes());
        }
    }
    Some(format!("{:x}", hasher.finalize()))
}

fn update_length_prefixed(hasher: &mut Md5, data: &[u8]) {
    hasher.update((data.len() as u32).to_be_bytes());
    hasher.update(data);
}

/// Content-based deduplication key: SHA-256 over the body and the attribute
/// names, types and values in name order.
pub fn content_dedup_key(
    body: &str,
    attributes: &BTreeMap<String, MessageAttributeValue>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    for (name, value) in attributes {
        hasher.update(name.as_bytes());
        hasher.update(value.data_type.as_bytes());
        if let Some(s) = &value.string_value {
            hasher.update(s.as_bytes());
        }
        if let Some(b) = &value.binary_value {
            hasher.update(b.as_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}
