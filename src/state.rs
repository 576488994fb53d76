use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::error::SqsError;
use crate::queue::{
    Message, Permission, Queue, RedrivePolicy, MAXIMUM_BATCH_SIZE, MAXIMUM_VISIBILITY_TIMEOUT,
};
use crate::types::*;

/// One registered queue: its engine state behind a per-queue mutex, plus the
/// wakeup channel for long polls. Operations on different queues never contend.
struct QueueCell {
    queue: Mutex<Queue>,
    notify: Notify,
}

pub struct SqsState {
    queues: Mutex<HashMap<String, Arc<QueueCell>>>,
    account_id: String,
    region: String,
    port: u16,
}

impl SqsState {
    pub fn new(account_id: String, region: String, port: u16) -> Self {
        SqsState {
            queues: Mutex::new(HashMap::new()),
            account_id,
            region,
            port,
        }
    }

    /// Drops every queue. Test hook only; production lifecycle is
    /// create-at-startup, die-with-process.
    pub async fn reset(&self) {
        self.queues.lock().await.clear();
    }

    fn queue_url(&self, name: &str) -> String {
        format!("http://localhost:{}/{}/{}", self.port, self.account_id, name)
    }

    fn queue_arn(&self, name: &str) -> String {
        format!("arn:aws:sqs:{}:{}:{}", self.region, self.account_id, name)
    }

    /// Callers may pass a full queue URL or a bare queue name.
    fn queue_name(url_or_name: &str) -> &str {
        url_or_name.rsplit('/').next().unwrap_or(url_or_name)
    }

    fn arn_queue_name(arn: &str) -> &str {
        arn.rsplit(':').next().unwrap_or(arn)
    }

    async fn resolve(&self, url_or_name: &str) -> Result<Arc<QueueCell>, SqsError> {
        let name = Self::queue_name(url_or_name);
        self.queues
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SqsError::QueueDoesNotExist(name.to_string()))
    }

    /// Lazy sweep, run at the start of every queue operation: expires lapsed
    /// leases and hands exhausted messages to the dead-letter queue. The
    /// source lock is released before the DLQ lock is taken.
    async fn sweep(&self, cell: &Arc<QueueCell>) {
        let now = Utc::now();
        let (outcome, source, target_arn) = {
            let mut queue = cell.queue.lock().await;
            let outcome = queue.reconcile(now);
            let target = queue
                .redrive_policy
                .as_ref()
                .map(|p| p.dead_letter_target_arn.clone());
            (outcome, queue.name.clone(), target)
        };

        if outcome.released > 0 {
            debug!(queue = %source, released = outcome.released, "leases expired");
            cell.notify.notify_waiters();
        }
        if outcome.dead_letters.is_empty() {
            return;
        }
        let Some(arn) = target_arn else { return };
        let Ok(dlq) = self.resolve(Self::arn_queue_name(&arn)).await else {
            return;
        };
        let count = outcome.dead_letters.len();
        {
            let mut queue = dlq.queue.lock().await;
            for msg in outcome.dead_letters {
                queue.accept_dead_letter(msg);
            }
        }
        info!(queue = %source, dlq = %Self::arn_queue_name(&arn), count, "messages dead-lettered");
        dlq.notify.notify_waiters();
    }

    // --- Queue management ---

    pub async fn create_queue(
        &self,
        req: CreateQueueRequest,
    ) -> Result<CreateQueueResponse, SqsError> {
        validate_queue_name(&req.queue_name)?;
        let now = Utc::now();
        let mut queues = self.queues.lock().await;

        if let Some(cell) = queues.get(&req.queue_name) {
            // Re-creating with identical attributes is idempotent; any
            // mismatch is a conflict.
            let queue = cell.queue.lock().await;
            let current = queue.attributes(now);
            if let Some(attrs) = &req.attributes {
                for (name, value) in attrs {
                    if current.get(name) != Some(value) {
                        return Err(SqsError::QueueAlreadyExists(req.queue_name.clone()));
                    }
                }
            }
            return Ok(CreateQueueResponse {
                queue_url: queue.url.clone(),
            });
        }

        let mut queue = Queue::new(
            &req.queue_name,
            self.queue_arn(&req.queue_name),
            self.queue_url(&req.queue_name),
            now,
        );
        if let Some(attrs) = &req.attributes {
            if let Some(raw) = attrs.get("RedrivePolicy") {
                validate_redrive_target(&queues, raw, queue.is_fifo)?;
            }
            for (name, value) in attrs {
                queue.set_attribute(name, value)?;
            }
        }
        if let Some(tags) = req.tags {
            queue.tags.extend(tags);
        }

        let url = queue.url.clone();
        info!(queue = %req.queue_name, fifo = queue.is_fifo, "queue created");
        queues.insert(
            req.queue_name,
            Arc::new(QueueCell {
                queue: Mutex::new(queue),
                notify: Notify::new(),
            }),
        );
        Ok(CreateQueueResponse { queue_url: url })
    }

    pub async fn delete_queue(&self, req: DeleteQueueRequest) -> Result<(), SqsError> {
        let name = Self::queue_name(&req.queue_url);
        let removed = self.queues.lock().await.remove(name);
        match removed {
            // In-flight messages never block deletion; they die with the queue.
            Some(cell) => {
                cell.notify.notify_waiters();
                info!(queue = %name, "queue deleted");
                Ok(())
            }
            None => Err(SqsError::QueueDoesNotExist(name.to_string())),
        }
    }

    pub async fn get_queue_url(
        &self,
        req: GetQueueUrlRequest,
    ) -> Result<GetQueueUrlResponse, SqsError> {
        let cell = self.resolve(&req.queue_name).await?;
        let url = cell.queue.lock().await.url.clone();
        Ok(GetQueueUrlResponse { queue_url: url })
    }

    pub async fn list_queues(
        &self,
        req: ListQueuesRequest,
    ) -> Result<ListQueuesResponse, SqsError> {
        let queues = self.queues.lock().await;
        let mut names: Vec<&String> = queues
            .keys()
            .filter(|n| match &req.queue_name_prefix {
                Some(p) => n.starts_with(p.as_str()),
                None => true,
            })
            .collect();
        names.sort();

        // Explicit cursor: results sorted by name, the token is the last name
        // of the previous page.
        if let Some(token) = &req.next_token {
            names.retain(|n| n.as_str() > token.as_str());
        }

        let mut next_token = None;
        if let Some(max) = req.max_results {
            if !(1..=1000).contains(&max) {
                return Err(SqsError::InvalidParameterValue(format!(
                    "Value {max} for parameter MaxResults is invalid. Reason: MaxResults must be >= 1 and <= 1000."
                )));
            }
            let max = max as usize;
            if names.len() > max {
                names.truncate(max);
                next_token = names.last().map(|n| n.to_string());
            }
        }

        let urls: Vec<String> = names.iter().map(|n| self.queue_url(n)).collect();
        Ok(ListQueuesResponse {
            queue_urls: if urls.is_empty() { None } else { Some(urls) },
            next_token,
        })
    }

    pub async fn get_queue_attributes(
        &self,
        req: GetQueueAttributesRequest,
    ) -> Result<GetQueueAttributesResponse, SqsError> {
        let cell = self.resolve(&req.queue_url).await?;
        self.sweep(&cell).await;

        let all = cell.queue.lock().await.attributes(Utc::now());
        let attributes = match &req.attribute_names {
            None => all,
            Some(names) if names.iter().any(|n| n == "All") => all,
            Some(names) => {
                let mut picked = HashMap::new();
                for name in names {
                    if !KNOWN_QUEUE_ATTRIBUTES.contains(&name.as_str()) {
                        return Err(SqsError::InvalidAttributeName(name.clone()));
                    }
                    if let Some(value) = all.get(name) {
                        picked.insert(name.clone(), value.clone());
                    }
                }
                picked
            }
        };
        Ok(GetQueueAttributesResponse { attributes })
    }

    pub async fn set_queue_attributes(
        &self,
        req: SetQueueAttributesRequest,
    ) -> Result<(), SqsError> {
        let cell = self.resolve(&req.queue_url).await?;
        if let Some(raw) = req.attributes.get("RedrivePolicy") {
            if !raw.is_empty() {
                let queues = self.queues.lock().await;
                let is_fifo = req.queue_url.ends_with(".fifo");
                validate_redrive_target(&queues, raw, is_fifo)?;
            }
        }
        let mut queue = cell.queue.lock().await;
        for (name, value) in &req.attributes {
            queue.set_attribute(name, value)?;
        }
        Ok(())
    }

    pub async fn purge_queue(&self, req: PurgeQueueRequest) -> Result<(), SqsError> {
        let cell = self.resolve(&req.queue_url).await?;
        let mut queue = cell.queue.lock().await;
        queue.purge();
        info!(queue = %queue.name, "queue purged");
        Ok(())
    }

    pub async fn list_dead_letter_source_queues(
        &self,
        req: ListDeadLetterSourceQueuesRequest,
    ) -> Result<ListDeadLetterSourceQueuesResponse, SqsError> {
        let cell = self.resolve(&req.queue_url).await?;
        let dlq_arn = cell.queue.lock().await.arn.clone();

        let cells: Vec<Arc<QueueCell>> = self.queues.lock().await.values().cloned().collect();
        let mut queue_urls = Vec::new();
        for cell in cells {
            let queue = cell.queue.lock().await;
            if matches!(&queue.redrive_policy, Some(p) if p.dead_letter_target_arn == dlq_arn) {
                queue_urls.push(queue.url.clone());
            }
        }
        queue_urls.sort();
        Ok(ListDeadLetterSourceQueuesResponse { queue_urls })
    }

    // --- Send ---

    pub async fn send_message(
        &self,
        req: SendMessageRequest,
    ) -> Result<SendMessageResponse, SqsError> {
        let cell = self.resolve(&req.queue_url).await?;
        self.sweep(&cell).await;

        let outcome = {
            let mut queue = cell.queue.lock().await;
            queue.send(
                req.message_body,
                to_sorted(req.message_attributes),
                to_sorted(req.message_system_attributes),
                req.delay_seconds.map(i64::from),
                req.message_group_id,
                req.message_deduplication_id,
                Utc::now(),
            )?
        };
        debug!(
            queue = %Self::queue_name(&req.queue_url),
            message_id = %outcome.message_id,
            deduplicated = outcome.deduplicated,
            "message sent"
        );
        cell.notify.notify_waiters();
        Ok(SendMessageResponse {
            message_id: outcome.message_id,
            md5_of_message_body: outcome.md5_of_message_body,
            md5_of_message_attributes: outcome.md5_of_message_attributes,
            sequence_number: outcome.sequence_number,
        })
    }

    pub async fn send_message_batch(
        &self,
        req: SendMessageBatchRequest,
    ) -> Result<SendMessageBatchResponse, SqsError> {
        let cell = self.resolve(&req.queue_url).await?;
        check_batch_entry_ids(req.entries.iter().map(|e| e.id.as_str()))?;
        self.sweep(&cell).await;

        let mut successful = Vec::new();
        let mut failed = Vec::new();
        {
            let mut queue = cell.queue.lock().await;
            let now = Utc::now();
            for entry in req.entries {
                match queue.send(
                    entry.message_body,
                    to_sorted(entry.message_attributes),
                    to_sorted(entry.message_system_attributes),
                    entry.delay_seconds.map(i64::from),
                    entry.message_group_id,
                    entry.message_deduplication_id,
                    now,
                ) {
                    Ok(outcome) => successful.push(SendMessageBatchResultEntry {
                        id: entry.id,
                        message_id: outcome.message_id,
                        md5_of_message_body: outcome.md5_of_message_body,
                        md5_of_message_attributes: outcome.md5_of_message_attributes,
                        sequence_number: outcome.sequence_number,
                    }),
                    Err(err) => failed.push(batch_failure(entry.id, err)),
                }
            }
        }
        if !successful.is_empty() {
            cell.notify.notify_waiters();
        }
        Ok(SendMessageBatchResponse { successful, failed })
    }

    // --- Receive ---

    pub async fn receive_message(
        &self,
        req: ReceiveMessageRequest,
    ) -> Result<ReceiveMessageResponse, SqsError> {
        let count = req.max_number_of_messages.unwrap_or(1);
        if !(1..=10).contains(&count) {
            return Err(SqsError::InvalidParameterValue(format!(
                "Value {count} for parameter MaxNumberOfMessages is invalid. Reason: must be between 1 and 10, if provided."
            )));
        }
        if let Some(wait) = req.wait_time_seconds {
            if !(0..=20).contains(&wait) {
                return Err(SqsError::InvalidParameterValue(format!(
                    "Value {wait} for parameter WaitTimeSeconds is invalid. Reason: must be >= 0 and <= 20, if provided."
                )));
            }
        }
        if let Some(timeout) = req.visibility_timeout {
            validate_visibility_timeout(timeout)?;
        }

        let cell = self.resolve(&req.queue_url).await?;
        let (default_visibility, default_wait) = {
            let queue = cell.queue.lock().await;
            (
                queue.visibility_timeout,
                queue.receive_message_wait_time_seconds,
            )
        };
        let visibility = req
            .visibility_timeout
            .map(i64::from)
            .unwrap_or(default_visibility);
        let wait = req.wait_time_seconds.map(i64::from).unwrap_or(default_wait);
        let deadline = Instant::now() + StdDuration::from_secs(wait as u64);

        let mut system_names = req.attribute_names.clone().unwrap_or_default();
        system_names.extend(req.message_system_attribute_names.clone().unwrap_or_default());
        let attribute_names = req.message_attribute_names.clone().unwrap_or_default();

        // Long poll: register the waiter before checking eligibility so a
        // send landing between the check and the await is never missed.
        let batch = loop {
            let notified = cell.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.sweep(&cell).await;
            let now = Utc::now();
            let (batch, wakeup) = {
                let mut queue = cell.queue.lock().await;
                let batch = queue.receive(count as usize, visibility, now);
                (batch, queue.next_wakeup(now))
            };
            if !batch.is_empty() {
                break batch;
            }
            if Instant::now() >= deadline {
                break Vec::new();
            }

            // Sleep no longer than the next lease/delay expiry so messages
            // freed mid-poll are delivered promptly.
            let mut sleep_deadline = deadline;
            if let Some(at) = wakeup {
                let millis = (at - now).num_milliseconds().max(0) as u64;
                let candidate = Instant::now() + StdDuration::from_millis(millis + 1);
                if candidate < sleep_deadline {
                    sleep_deadline = candidate;
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(sleep_deadline) => {}
            }
        };

        if batch.is_empty() {
            return Ok(ReceiveMessageResponse { messages: None });
        }
        debug!(
            queue = %Self::queue_name(&req.queue_url),
            count = batch.len(),
            "messages received"
        );
        let messages = batch
            .iter()
            .map(|m| self.render_message(m, &system_names, &attribute_names))
            .collect();
        Ok(ReceiveMessageResponse {
            messages: Some(messages),
        })
    }

    fn render_message(
        &self,
        msg: &Message,
        system_names: &[String],
        attribute_names: &[String],
    ) -> ReceivedMessage {
        let wants_system =
            |name: &str| system_names.iter().any(|n| n == "All" || n == name);
        let mut system = HashMap::new();
        if wants_system("SenderId") {
            system.insert("SenderId".to_string(), self.account_id.clone());
        }
        if wants_system("SentTimestamp") {
            system.insert(
                "SentTimestamp".to_string(),
                msg.sent_at.timestamp_millis().to_string(),
            );
        }
        if wants_system("ApproximateReceiveCount") {
            system.insert(
                "ApproximateReceiveCount".to_string(),
                msg.receive_count.to_string(),
            );
        }
        if let Some(first) = msg.first_received_at {
            if wants_system("ApproximateFirstReceiveTimestamp") {
                system.insert(
                    "ApproximateFirstReceiveTimestamp".to_string(),
                    first.timestamp_millis().to_string(),
                );
            }
        }
        if let Some(group) = &msg.group_id {
            if wants_system("MessageGroupId") {
                system.insert("MessageGroupId".to_string(), group.clone());
            }
        }
        if let Some(dedup) = &msg.dedup_id {
            if wants_system("MessageDeduplicationId") {
                system.insert("MessageDeduplicationId".to_string(), dedup.clone());
            }
        }
        if let Some(seq) = &msg.sequence_number {
            if wants_system("SequenceNumber") {
                system.insert("SequenceNumber".to_string(), seq.clone());
            }
        }

        let wants_attribute =
            |name: &str| attribute_names.iter().any(|n| n == "All" || n == ".*" || n == name);
        let attributes: HashMap<String, MessageAttributeValue> = msg
            .attributes
            .iter()
            .filter(|(name, _)| wants_attribute(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        ReceivedMessage {
            message_id: msg.id.clone(),
            receipt_handle: msg.receipt_handle.clone().unwrap_or_default(),
            body: msg.body.clone(),
            md5_of_body: msg.md5_of_body.clone(),
            md5_of_message_attributes: if attributes.is_empty() {
                None
            } else {
                msg.md5_of_attributes.clone()
            },
            attributes: if system.is_empty() {
                None
            } else {
                Some(system)
            },
            message_attributes: if attributes.is_empty() {
                None
            } else {
                Some(attributes)
            },
        }
    }

    // --- Delete ---

    pub async fn delete_message(&self, req: DeleteMessageRequest) -> Result<(), SqsError> {
        let cell = self.resolve(&req.queue_url).await?;
        self.sweep(&cell).await;

        // Idempotent: a stale handle is a silent success.
        let deleted = cell.queue.lock().await.delete(&req.receipt_handle);
        if deleted {
            debug!(queue = %Self::queue_name(&req.queue_url), "message deleted");
            cell.notify.notify_waiters();
        }
        Ok(())
    }

    pub async fn delete_message_batch(
        &self,
        req: DeleteMessageBatchRequest,
    ) -> Result<DeleteMessageBatchResponse, SqsError> {
        let cell = self.resolve(&req.queue_url).await?;
        check_batch_entry_ids(req.entries.iter().map(|e| e.id.as_str()))?;
        // Two entries naming the same receipt handle are as indistinct as two
        // entries naming the same id.
        let mut handles_seen = HashSet::new();
        for entry in &req.entries {
            if !handles_seen.insert(entry.receipt_handle.as_str()) {
                return Err(SqsError::BatchEntryIdsNotDistinct(entry.id.clone()));
            }
        }
        self.sweep(&cell).await;

        let mut successful = Vec::new();
        let mut failed = Vec::new();
        {
            let mut queue = cell.queue.lock().await;
            for entry in req.entries {
                if queue.delete(&entry.receipt_handle) {
                    successful.push(BatchResultIdEntry { id: entry.id });
                } else {
                    failed.push(batch_failure(
                        entry.id,
                        SqsError::ReceiptHandleIsInvalid(entry.receipt_handle),
                    ));
                }
            }
        }
        if !successful.is_empty() {
            cell.notify.notify_waiters();
        }
        Ok(DeleteMessageBatchResponse { successful, failed })
    }

    // --- Visibility ---

    pub async fn change_message_visibility(
        &self,
        req: ChangeMessageVisibilityRequest,
    ) -> Result<(), SqsError> {
        validate_visibility_timeout(req.visibility_timeout)?;
        let cell = self.resolve(&req.queue_url).await?;
        self.sweep(&cell).await;

        cell.queue.lock().await.change_visibility(
            &req.receipt_handle,
            i64::from(req.visibility_timeout),
            Utc::now(),
        )?;
        if req.visibility_timeout == 0 {
            // Lease released early; wake pollers so the next sweep hands the
            // message out again.
            cell.notify.notify_waiters();
        }
        Ok(())
    }

    pub async fn change_message_visibility_batch(
        &self,
        req: ChangeMessageVisibilityBatchRequest,
    ) -> Result<ChangeMessageVisibilityBatchResponse, SqsError> {
        let cell = self.resolve(&req.queue_url).await?;
        check_batch_entry_ids(req.entries.iter().map(|e| e.id.as_str()))?;
        self.sweep(&cell).await;

        let mut successful = Vec::new();
        let mut failed = Vec::new();
        let mut released = false;
        {
            let mut queue = cell.queue.lock().await;
            let now = Utc::now();
            for entry in req.entries {
                let result = validate_visibility_timeout(entry.visibility_timeout).and_then(|_| {
                    queue.change_visibility(
                        &entry.receipt_handle,
                        i64::from(entry.visibility_timeout),
                        now,
                    )
                });
                match result {
                    Ok(()) => {
                        released |= entry.visibility_timeout == 0;
                        successful.push(BatchResultIdEntry { id: entry.id });
                    }
                    Err(err) => failed.push(batch_failure(entry.id, err)),
                }
            }
        }
        if released {
            cell.notify.notify_waiters();
        }
        Ok(ChangeMessageVisibilityBatchResponse { successful, failed })
    }

    // --- Tags / permissions ---

    pub async fn tag_queue(&self, req: TagQueueRequest) -> Result<(), SqsError> {
        let cell = self.resolve(&req.queue_url).await?;
        cell.queue.lock().await.tags.extend(req.tags);
        Ok(())
    }

    pub async fn untag_queue(&self, req: UntagQueueRequest) -> Result<(), SqsError> {
        let cell = self.resolve(&req.queue_url).await?;
        let mut queue = cell.queue.lock().await;
        for key in &req.tag_keys {
            queue.tags.remove(key);
        }
        Ok(())
    }

    pub async fn list_queue_tags(
        &self,
        req: ListQueueTagsRequest,
    ) -> Result<ListQueueTagsResponse, SqsError> {
        let cell = self.resolve(&req.queue_url).await?;
        let tags = cell.queue.lock().await.tags.clone();
        Ok(ListQueueTagsResponse {
            tags: if tags.is_empty() { None } else { Some(tags) },
        })
    }

    pub async fn add_permission(&self, req: AddPermissionRequest) -> Result<(), SqsError> {
        let cell = self.resolve(&req.queue_url).await?;
        let mut queue = cell.queue.lock().await;
        if queue.permissions.contains_key(&req.label) {
            return Err(SqsError::InvalidParameterValue(format!(
                "Value {} for parameter Label is invalid. Reason: Already exists.",
                req.label
            )));
        }
        queue.permissions.insert(
            req.label,
            Permission {
                aws_account_ids: req.aws_account_ids,
                actions: req.actions,
            },
        );
        Ok(())
    }

    pub async fn remove_permission(&self, req: RemovePermissionRequest) -> Result<(), SqsError> {
        let cell = self.resolve(&req.queue_url).await?;
        let mut queue = cell.queue.lock().await;
        if queue.permissions.remove(&req.label).is_none() {
            return Err(SqsError::InvalidParameterValue(format!(
                "Value {} for parameter Label is invalid. Reason: can't find label on existing policy.",
                req.label
            )));
        }
        Ok(())
    }
}

const KNOWN_QUEUE_ATTRIBUTES: &[&str] = &[
    "ApproximateNumberOfMessages",
    "ApproximateNumberOfMessagesDelayed",
    "ApproximateNumberOfMessagesNotVisible",
    "ContentBasedDeduplication",
    "CreatedTimestamp",
    "DelaySeconds",
    "FifoQueue",
    "MaximumMessageSize",
    "MessageRetentionPeriod",
    "Policy",
    "QueueArn",
    "ReceiveMessageWaitTimeSeconds",
    "RedrivePolicy",
    "VisibilityTimeout",
];

fn validate_queue_name(name: &str) -> Result<(), SqsError> {
    let base = name.strip_suffix(".fifo").unwrap_or(name);
    let valid = !base.is_empty()
        && name.len() <= 80
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SqsError::InvalidParameterValue(format!(
            "Value {name} for parameter QueueName is invalid. Reason: Can only include alphanumeric characters, hyphens, or underscores. 1 to 80 in length."
        )))
    }
}

fn validate_visibility_timeout(timeout: i32) -> Result<(), SqsError> {
    if (0..=MAXIMUM_VISIBILITY_TIMEOUT).contains(&i64::from(timeout)) {
        Ok(())
    } else {
        Err(SqsError::InvalidParameterValue(format!(
            "Value {timeout} for parameter VisibilityTimeout is invalid. Reason: VisibilityTimeout must be >= 0 and <= {MAXIMUM_VISIBILITY_TIMEOUT}."
        )))
    }
}

fn validate_redrive_target(
    queues: &HashMap<String, Arc<QueueCell>>,
    raw: &str,
    source_is_fifo: bool,
) -> Result<(), SqsError> {
    let policy = RedrivePolicy::parse(raw)?;
    let target = SqsState::arn_queue_name(&policy.dead_letter_target_arn);
    if !queues.contains_key(target) {
        return Err(SqsError::InvalidParameterValue(format!(
            "Value {raw} for parameter RedrivePolicy is invalid. Reason: Dead letter target does not exist."
        )));
    }
    if target.ends_with(".fifo") != source_is_fifo {
        return Err(SqsError::InvalidParameterValue(format!(
            "Value {raw} for parameter RedrivePolicy is invalid. Reason: Dead letter queue must be of the same type as the source queue."
        )));
    }
    Ok(())
}

/// Batch-wide entry-id validation, shared by every batch operation.
fn check_batch_entry_ids<'a>(ids: impl ExactSizeIterator<Item = &'a str>) -> Result<(), SqsError> {
    if ids.len() == 0 {
        return Err(SqsError::EmptyBatchRequest);
    }
    if ids.len() > MAXIMUM_BATCH_SIZE {
        return Err(SqsError::TooManyEntriesInBatchRequest(ids.len()));
    }
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(SqsError::BatchEntryIdsNotDistinct(id.to_string()));
        }
    }
    Ok(())
}

fn batch_failure(id: String, err: SqsError) -> BatchResultErrorEntry {
    BatchResultErrorEntry {
        id,
        code: err.error_code().to_string(),
        message: err.message(),
        sender_fault: true,
    }
}

fn to_sorted(
    attributes: Option<HashMap<String, MessageAttributeValue>>,
) -> BTreeMap<String, MessageAttributeValue> {
    attributes.unwrap_or_default().into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::md5_hex;
    use std::time::Duration as StdDuration;

    fn state() -> Arc<SqsState> {
        Arc::new(SqsState::new(
            "000000000000".into(),
            "us-east-1".into(),
            9324,
        ))
    }

    async fn make_queue(state: &SqsState, name: &str) -> String {
        make_queue_with(state, name, None).await
    }

    async fn make_queue_with(
        state: &SqsState,
        name: &str,
        attributes: Option<HashMap<String, String>>,
    ) -> String {
        state
            .create_queue(CreateQueueRequest {
                queue_name: name.into(),
                attributes,
                tags: None,
            })
            .await
            .unwrap()
            .queue_url
    }

    async fn send(state: &SqsState, url: &str, body: &str) -> SendMessageResponse {
        state
            .send_message(SendMessageRequest {
                queue_url: url.into(),
                message_body: body.into(),
                delay_seconds: None,
                message_attributes: None,
                message_system_attributes: None,
                message_deduplication_id: None,
                message_group_id: None,
            })
            .await
            .unwrap()
    }

    fn receive_req(url: &str) -> ReceiveMessageRequest {
        ReceiveMessageRequest {
            queue_url: url.into(),
            max_number_of_messages: None,
            visibility_timeout: None,
            wait_time_seconds: Some(0),
            attribute_names: None,
            message_system_attribute_names: None,
            message_attribute_names: None,
        }
    }

    async fn receive_one(state: &SqsState, url: &str) -> ReceivedMessage {
        state
            .receive_message(receive_req(url))
            .await
            .unwrap()
            .messages
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn create_queue_is_idempotent_for_matching_attributes() {
        let state = state();
        let url = make_queue(&state, "jobs").await;
        let again = make_queue_with(
            &state,
            "jobs",
            Some(HashMap::from([("VisibilityTimeout".into(), "30".into())])),
        )
        .await;
        assert_eq!(url, again);

        let err = state
            .create_queue(CreateQueueRequest {
                queue_name: "jobs".into(),
                attributes: Some(HashMap::from([("VisibilityTimeout".into(), "60".into())])),
                tags: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SqsError::QueueAlreadyExists(_)));
    }

    #[tokio::test]
    async fn create_queue_rejects_bad_names() {
        let state = state();
        for name in ["", "has space", "a".repeat(81).as_str(), ".fifo"] {
            let err = state
                .create_queue(CreateQueueRequest {
                    queue_name: name.into(),
                    attributes: None,
                    tags: None,
                })
                .await
                .unwrap_err();
            assert!(matches!(err, SqsError::InvalidParameterValue(_)), "{name}");
        }
    }

    #[tokio::test]
    async fn deleted_queue_disappears_from_listing() {
        let state = state();
        let url = make_queue(&state, "gone").await;
        send(&state, &url, "still in flight").await;
        receive_one(&state, &url).await;

        // In-flight messages do not guard the queue.
        state
            .delete_queue(DeleteQueueRequest {
                queue_url: url.clone(),
            })
            .await
            .unwrap();
        let listing = state.list_queues(ListQueuesRequest::default()).await.unwrap();
        assert!(listing.queue_urls.is_none());
        let err = state.receive_message(receive_req(&url)).await.unwrap_err();
        assert!(matches!(err, SqsError::QueueDoesNotExist(_)));
    }

    #[tokio::test]
    async fn list_queues_paginates_with_cursor() {
        let state = state();
        for name in ["page-a", "page-b", "page-c", "other"] {
            make_queue(&state, name).await;
        }

        let first = state
            .list_queues(ListQueuesRequest {
                queue_name_prefix: Some("page-".into()),
                max_results: Some(2),
                next_token: None,
            })
            .await
            .unwrap();
        assert_eq!(first.queue_urls.as_ref().unwrap().len(), 2);
        let token = first.next_token.clone().unwrap();

        let second = state
            .list_queues(ListQueuesRequest {
                queue_name_prefix: Some("page-".into()),
                max_results: Some(2),
                next_token: Some(token),
            })
            .await
            .unwrap();
        let urls = second.queue_urls.unwrap();
        assert_eq!(urls.len(), 1);
        assert!(urls[0].ends_with("page-c"));
        assert!(second.next_token.is_none());
    }

    #[tokio::test]
    async fn send_receive_round_trip_preserves_payload() {
        let state = state();
        let url = make_queue(&state, "round-trip").await;

        let attrs = HashMap::from([(
            "trace".to_string(),
            MessageAttributeValue {
                data_type: "String".into(),
                string_value: Some("abc-123".into()),
                binary_value: None,
            },
        )]);
        let sent = state
            .send_message(SendMessageRequest {
                queue_url: url.clone(),
                message_body: "payload".into(),
                delay_seconds: None,
                message_attributes: Some(attrs.clone()),
                message_system_attributes: None,
                message_deduplication_id: None,
                message_group_id: None,
            })
            .await
            .unwrap();
        assert_eq!(sent.md5_of_message_body, md5_hex(b"payload"));
        assert!(sent.md5_of_message_attributes.is_some());

        let mut req = receive_req(&url);
        req.message_attribute_names = Some(vec!["All".into()]);
        req.attribute_names = Some(vec!["All".into()]);
        let msg = state
            .receive_message(req)
            .await
            .unwrap()
            .messages
            .unwrap()
            .remove(0);

        assert_eq!(msg.message_id, sent.message_id);
        assert_eq!(msg.body, "payload");
        assert_eq!(msg.md5_of_body, sent.md5_of_message_body);
        assert_eq!(msg.md5_of_message_attributes, sent.md5_of_message_attributes);
        assert_eq!(msg.message_attributes.unwrap(), attrs);
        let system = msg.attributes.unwrap();
        assert_eq!(system["ApproximateReceiveCount"], "1");
        assert!(system.contains_key("SentTimestamp"));
    }

    #[tokio::test]
    async fn receive_validates_parameters() {
        let state = state();
        let url = make_queue(&state, "validated").await;

        let mut req = receive_req(&url);
        req.max_number_of_messages = Some(11);
        assert!(state.receive_message(req).await.is_err());

        let mut req = receive_req(&url);
        req.wait_time_seconds = Some(21);
        assert!(state.receive_message(req).await.is_err());

        let mut req = receive_req(&url);
        req.visibility_timeout = Some(43_201);
        assert!(state.receive_message(req).await.is_err());
    }

    #[tokio::test]
    async fn batch_send_isolates_per_entry_failures() {
        let state = state();
        let url = make_queue(&state, "batch").await;

        let entry = |id: &str, delay: Option<i32>| SendMessageBatchEntry {
            id: id.into(),
            message_body: "m".into(),
            delay_seconds: delay,
            message_attributes: None,
            message_system_attributes: None,
            message_deduplication_id: None,
            message_group_id: None,
        };
        let resp = state
            .send_message_batch(SendMessageBatchRequest {
                queue_url: url.clone(),
                entries: vec![entry("ok", None), entry("bad", Some(1800))],
            })
            .await
            .unwrap();

        assert_eq!(resp.successful.len(), 1);
        assert_eq!(resp.successful[0].id, "ok");
        assert_eq!(resp.failed.len(), 1);
        assert_eq!(resp.failed[0].id, "bad");
        assert_eq!(resp.failed[0].code, "InvalidParameterValue");
        assert!(resp.failed[0].sender_fault);

        // The good entry actually landed.
        assert_eq!(receive_one(&state, &url).await.body, "m");
    }

    #[tokio::test]
    async fn batch_wide_violations_abort_before_any_entry() {
        let state = state();
        let url = make_queue(&state, "batch-wide").await;

        let entry = |id: &str| SendMessageBatchEntry {
            id: id.into(),
            message_body: "m".into(),
            delay_seconds: None,
            message_attributes: None,
            message_system_attributes: None,
            message_deduplication_id: None,
            message_group_id: None,
        };

        let err = state
            .send_message_batch(SendMessageBatchRequest {
                queue_url: url.clone(),
                entries: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SqsError::EmptyBatchRequest));

        let err = state
            .send_message_batch(SendMessageBatchRequest {
                queue_url: url.clone(),
                entries: vec![entry("dup"), entry("dup")],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SqsError::BatchEntryIdsNotDistinct(_)));

        let err = state
            .send_message_batch(SendMessageBatchRequest {
                queue_url: url.clone(),
                entries: (0..11).map(|i| entry(&format!("e{i}"))).collect(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SqsError::TooManyEntriesInBatchRequest(11)));

        // Nothing was enqueued by the aborted batches.
        let resp = state.receive_message(receive_req(&url)).await.unwrap();
        assert!(resp.messages.is_none());
    }

    #[tokio::test]
    async fn delete_message_is_idempotent() {
        let state = state();
        let url = make_queue(&state, "del").await;
        send(&state, &url, "m").await;
        let msg = receive_one(&state, &url).await;

        for _ in 0..2 {
            state
                .delete_message(DeleteMessageRequest {
                    queue_url: url.clone(),
                    receipt_handle: msg.receipt_handle.clone(),
                })
                .await
                .unwrap();
        }
        let resp = state.receive_message(receive_req(&url)).await.unwrap();
        assert!(resp.messages.is_none());
    }

    #[tokio::test]
    async fn delete_batch_duplicate_receipt_handles_abort() {
        let state = state();
        let url = make_queue(&state, "del-batch-dup").await;
        send(&state, &url, "m").await;
        let msg = receive_one(&state, &url).await;

        let err = state
            .delete_message_batch(DeleteMessageBatchRequest {
                queue_url: url.clone(),
                entries: vec![
                    DeleteMessageBatchEntry {
                        id: "a".into(),
                        receipt_handle: msg.receipt_handle.clone(),
                    },
                    DeleteMessageBatchEntry {
                        id: "b".into(),
                        receipt_handle: msg.receipt_handle.clone(),
                    },
                ],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SqsError::BatchEntryIdsNotDistinct(_)));
    }

    #[tokio::test]
    async fn delete_batch_reports_invalid_handles_per_entry() {
        let state = state();
        let url = make_queue(&state, "del-batch").await;
        send(&state, &url, "m").await;
        let msg = receive_one(&state, &url).await;

        let resp = state
            .delete_message_batch(DeleteMessageBatchRequest {
                queue_url: url.clone(),
                entries: vec![
                    DeleteMessageBatchEntry {
                        id: "good".into(),
                        receipt_handle: msg.receipt_handle.clone(),
                    },
                    DeleteMessageBatchEntry {
                        id: "stale".into(),
                        receipt_handle: "no-such-lease".into(),
                    },
                ],
            })
            .await
            .unwrap();
        assert_eq!(resp.successful.len(), 1);
        assert_eq!(resp.successful[0].id, "good");
        assert_eq!(resp.failed.len(), 1);
        assert_eq!(resp.failed[0].id, "stale");
        assert_eq!(resp.failed[0].code, "ReceiptHandleIsInvalid");
    }

    #[tokio::test]
    async fn change_visibility_rejects_stale_handles_and_bad_timeouts() {
        let state = state();
        let url = make_queue(&state, "vis").await;

        let err = state
            .change_message_visibility(ChangeMessageVisibilityRequest {
                queue_url: url.clone(),
                receipt_handle: "nope".into(),
                visibility_timeout: 43_201,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SqsError::InvalidParameterValue(_)));

        let err = state
            .change_message_visibility(ChangeMessageVisibilityRequest {
                queue_url: url.clone(),
                receipt_handle: "nope".into(),
                visibility_timeout: 10,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SqsError::ReceiptHandleIsInvalid(_)));
    }

    #[tokio::test]
    async fn change_visibility_zero_makes_message_eligible_again() {
        let state = state();
        let url = make_queue(&state, "vis-zero").await;
        send(&state, &url, "m").await;
        let msg = receive_one(&state, &url).await;

        // Hidden under the default 30s lease.
        let resp = state.receive_message(receive_req(&url)).await.unwrap();
        assert!(resp.messages.is_none());

        state
            .change_message_visibility(ChangeMessageVisibilityRequest {
                queue_url: url.clone(),
                receipt_handle: msg.receipt_handle.clone(),
                visibility_timeout: 0,
            })
            .await
            .unwrap();

        let again = receive_one(&state, &url).await;
        assert_eq!(again.message_id, msg.message_id);
        assert_ne!(again.receipt_handle, msg.receipt_handle);
    }

    #[tokio::test]
    async fn visibility_batch_isolates_entries() {
        let state = state();
        let url = make_queue(&state, "vis-batch").await;
        send(&state, &url, "m").await;
        let msg = receive_one(&state, &url).await;

        let resp = state
            .change_message_visibility_batch(ChangeMessageVisibilityBatchRequest {
                queue_url: url.clone(),
                entries: vec![
                    ChangeMessageVisibilityBatchEntry {
                        id: "ok".into(),
                        receipt_handle: msg.receipt_handle.clone(),
                        visibility_timeout: 60,
                    },
                    ChangeMessageVisibilityBatchEntry {
                        id: "stale".into(),
                        receipt_handle: "no-such-lease".into(),
                        visibility_timeout: 60,
                    },
                ],
            })
            .await
            .unwrap();
        assert_eq!(resp.successful.len(), 1);
        assert_eq!(resp.failed.len(), 1);
        assert_eq!(resp.failed[0].code, "ReceiptHandleIsInvalid");
    }

    #[tokio::test]
    async fn purge_discards_pre_purge_sends() {
        let state = state();
        let url = make_queue(&state, "purged").await;
        send(&state, &url, "m").await;

        state
            .purge_queue(PurgeQueueRequest {
                queue_url: url.clone(),
            })
            .await
            .unwrap();
        let resp = state.receive_message(receive_req(&url)).await.unwrap();
        assert!(resp.messages.is_none());
    }

    #[tokio::test]
    async fn redrive_moves_exhausted_message_to_dlq() {
        let state = state();
        let dlq_url = make_queue(&state, "work-dlq").await;
        let policy =
            r#"{"deadLetterTargetArn":"arn:aws:sqs:us-east-1:000000000000:work-dlq","maxReceiveCount":1}"#;
        let url = make_queue_with(
            &state,
            "work",
            Some(HashMap::from([("RedrivePolicy".into(), policy.into())])),
        )
        .await;

        send(&state, &url, "poison").await;

        // Receive with an instantly lapsing lease, then poll again: the sweep
        // finds receive_count == maxReceiveCount and redrives.
        let mut req = receive_req(&url);
        req.visibility_timeout = Some(0);
        let got = state.receive_message(req).await.unwrap().messages.unwrap();
        assert_eq!(got.len(), 1);

        let resp = state.receive_message(receive_req(&url)).await.unwrap();
        assert!(resp.messages.is_none());

        let moved = receive_one(&state, &dlq_url).await;
        assert_eq!(moved.body, "poison");

        let sources = state
            .list_dead_letter_source_queues(ListDeadLetterSourceQueuesRequest {
                queue_url: dlq_url.clone(),
            })
            .await
            .unwrap();
        assert_eq!(sources.queue_urls, vec![url]);
    }

    #[tokio::test]
    async fn redrive_policy_requires_existing_same_type_target() {
        let state = state();
        make_queue(&state, "source").await;

        let missing =
            r#"{"deadLetterTargetArn":"arn:aws:sqs:us-east-1:000000000000:absent","maxReceiveCount":3}"#;
        let err = state
            .set_queue_attributes(SetQueueAttributesRequest {
                queue_url: "source".into(),
                attributes: HashMap::from([("RedrivePolicy".into(), missing.into())]),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SqsError::InvalidParameterValue(_)));

        make_queue(&state, "wrong-type.fifo").await;
        let fifo_target =
            r#"{"deadLetterTargetArn":"arn:aws:sqs:us-east-1:000000000000:wrong-type.fifo","maxReceiveCount":3}"#;
        let err = state
            .set_queue_attributes(SetQueueAttributesRequest {
                queue_url: "source".into(),
                attributes: HashMap::from([("RedrivePolicy".into(), fifo_target.into())]),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SqsError::InvalidParameterValue(_)));
    }

    #[tokio::test]
    async fn fifo_order_and_dedup_through_the_service() {
        let state = state();
        let url = make_queue_with(
            &state,
            "tasks.fifo",
            Some(HashMap::from([("FifoQueue".into(), "true".into())])),
        )
        .await;

        let fifo_send = |body: &str, dedup: &str| SendMessageRequest {
            queue_url: url.clone(),
            message_body: body.into(),
            delay_seconds: None,
            message_attributes: None,
            message_system_attributes: None,
            message_deduplication_id: Some(dedup.into()),
            message_group_id: Some("g1".into()),
        };
        let first = state.send_message(fifo_send("a", "d1")).await.unwrap();
        state.send_message(fifo_send("b", "d2")).await.unwrap();
        let resent = state.send_message(fifo_send("a", "d1")).await.unwrap();
        assert_eq!(first.message_id, resent.message_id);
        assert_eq!(first.sequence_number, resent.sequence_number);

        // Group is locked while "a" is in flight.
        let a = receive_one(&state, &url).await;
        assert_eq!(a.body, "a");
        let resp = state.receive_message(receive_req(&url)).await.unwrap();
        assert!(resp.messages.is_none());

        state
            .delete_message(DeleteMessageRequest {
                queue_url: url.clone(),
                receipt_handle: a.receipt_handle,
            })
            .await
            .unwrap();
        let b = receive_one(&state, &url).await;
        assert_eq!(b.body, "b");
    }

    #[tokio::test]
    async fn long_poll_wakes_on_send() {
        let state = state();
        let url = make_queue(&state, "poll").await;

        let sender = Arc::clone(&state);
        let sender_url = url.clone();
        tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(100)).await;
            send(&sender, &sender_url, "late").await;
        });

        let started = std::time::Instant::now();
        let mut req = receive_req(&url);
        req.wait_time_seconds = Some(10);
        let msgs = state.receive_message(req).await.unwrap().messages.unwrap();
        assert_eq!(msgs[0].body, "late");
        assert!(started.elapsed() < StdDuration::from_secs(5));
    }

    #[tokio::test]
    async fn long_poll_returns_empty_at_deadline() {
        let state = state();
        let url = make_queue(&state, "poll-empty").await;

        let started = std::time::Instant::now();
        let mut req = receive_req(&url);
        req.wait_time_seconds = Some(1);
        let resp = state.receive_message(req).await.unwrap();
        assert!(resp.messages.is_none());
        assert!(started.elapsed() >= StdDuration::from_secs(1));
    }

    #[tokio::test]
    async fn long_poll_recovers_expiring_lease() {
        let state = state();
        let url = make_queue(&state, "poll-lease").await;
        send(&state, &url, "m").await;

        let mut req = receive_req(&url);
        req.visibility_timeout = Some(1);
        state.receive_message(req).await.unwrap();

        // No send happens during this poll; the lease lapsing at +1s must
        // wake it before the 10s deadline.
        let started = std::time::Instant::now();
        let mut req = receive_req(&url);
        req.wait_time_seconds = Some(10);
        let msgs = state.receive_message(req).await.unwrap().messages.unwrap();
        assert_eq!(msgs[0].body, "m");
        assert!(started.elapsed() < StdDuration::from_secs(5));
    }

    #[tokio::test]
    async fn queue_attributes_round_trip() {
        let state = state();
        let url = make_queue(&state, "attrs").await;

        state
            .set_queue_attributes(SetQueueAttributesRequest {
                queue_url: url.clone(),
                attributes: HashMap::from([("VisibilityTimeout".into(), "120".into())]),
            })
            .await
            .unwrap();

        let resp = state
            .get_queue_attributes(GetQueueAttributesRequest {
                queue_url: url.clone(),
                attribute_names: Some(vec!["VisibilityTimeout".into(), "QueueArn".into()]),
            })
            .await
            .unwrap();
        assert_eq!(resp.attributes["VisibilityTimeout"], "120");
        assert_eq!(
            resp.attributes["QueueArn"],
            "arn:aws:sqs:us-east-1:000000000000:attrs"
        );

        let err = state
            .get_queue_attributes(GetQueueAttributesRequest {
                queue_url: url,
                attribute_names: Some(vec!["Bogus".into()]),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SqsError::InvalidAttributeName(_)));
    }

    #[tokio::test]
    async fn tags_and_permissions_bookkeeping() {
        let state = state();
        let url = make_queue(&state, "meta").await;

        state
            .tag_queue(TagQueueRequest {
                queue_url: url.clone(),
                tags: HashMap::from([("env".into(), "test".into()), ("team".into(), "core".into())]),
            })
            .await
            .unwrap();
        state
            .untag_queue(UntagQueueRequest {
                queue_url: url.clone(),
                tag_keys: vec!["team".into()],
            })
            .await
            .unwrap();
        let tags = state
            .list_queue_tags(ListQueueTagsRequest {
                queue_url: url.clone(),
            })
            .await
            .unwrap()
            .tags
            .unwrap();
        assert_eq!(tags, HashMap::from([("env".into(), "test".into())]));

        let perm = AddPermissionRequest {
            queue_url: url.clone(),
            label: "readers".into(),
            aws_account_ids: vec!["123456789012".into()],
            actions: vec!["ReceiveMessage".into()],
        };
        state.add_permission(perm.clone()).await.unwrap();
        assert!(state.add_permission(perm).await.is_err());
        state
            .remove_permission(RemovePermissionRequest {
                queue_url: url.clone(),
                label: "readers".into(),
            })
            .await
            .unwrap();
        assert!(state
            .remove_permission(RemovePermissionRequest {
                queue_url: url,
                label: "readers".into(),
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn reset_clears_the_registry() {
        let state = state();
        make_queue(&state, "ephemeral").await;
        state.reset().await;
        let listing = state.list_queues(ListQueuesRequest::default()).await.unwrap();
        assert!(listing.queue_urls.is_none());
    }
}
