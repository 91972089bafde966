//! Turn-based reply-timeliness analysis of conversation transcripts.
//!
//! A "turn" is a maximal run of consecutive transcript items from one speaker
//! role. Metrics are computed under two policies that must both be reported:
//! the old rule drops a trailing unanswered customer turn entirely, while the
//! new rule counts it as unanswered-overtime when its last message landed
//! before the 01:00 local cutoff on the analysis date (a later message is
//! assumed to still be awaiting a reply when the nightly run fires).

use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// A reply within one hour of the customer's last message counts as timely.
pub const TIMELY_REPLY_THRESHOLD_SECS: i64 = 3600;

/// Local hour of the trailing-message cutoff on the analysis date.
const CUTOFF_HOUR: u32 = 1;

/// Speaker role of a transcript item, as delivered by the remote API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerRole {
    HostSalesman,
    CustomerContact,
}

/// One utterance from a conversation transcript. Times are unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptItem {
    #[serde(default)]
    pub entity_id: i64,
    pub entity_type: SpeakerRole,
    #[serde(default)]
    pub content: String,
    pub begin_time: i64,
    #[serde(default)]
    pub end_time: i64,
    #[serde(default)]
    pub order: i64,
}

/// Reply-timeliness metrics for one or more conversations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationMetrics {
    /// Customer turns under the old rule (trailing unanswered turn dropped).
    pub customer_turn_count: i64,
    /// Replies within [`TIMELY_REPLY_THRESHOLD_SECS`].
    pub timely_reply_count: i64,
    /// Replies slower than the threshold.
    pub overtime_reply_count: i64,
    /// Sum of all reply durations, in seconds.
    pub total_reply_duration: i64,
    /// Customer turns under the new rule (trailing turn counted when it
    /// predates the cutoff).
    pub new_rule_customer_turn_count: i64,
    /// Trailing unanswered customer turns counted as overtime-no-reply.
    pub overtime_no_reply_count: i64,
}

impl ConversationMetrics {
    /// Add another conversation's metrics into this aggregate.
    pub fn absorb(&mut self, other: &ConversationMetrics) {
        self.customer_turn_count += other.customer_turn_count;
        self.timely_reply_count += other.timely_reply_count;
        self.overtime_reply_count += other.overtime_reply_count;
        self.total_reply_duration += other.total_reply_duration;
        self.new_rule_customer_turn_count += other.new_rule_customer_turn_count;
        self.overtime_no_reply_count += other.overtime_no_reply_count;
    }
}

struct Turn {
    role: SpeakerRole,
    items: Vec<TranscriptItem>,
}

impl Turn {
    fn first_begin_time(&self) -> i64 {
        self.items.first().map(|i| i.begin_time).unwrap_or(0)
    }

    fn last_begin_time(&self) -> i64 {
        self.items.last().map(|i| i.begin_time).unwrap_or(0)
    }
}

/// Unix timestamp of `01:00:00` local time on the analysis date.
///
/// During a DST gap the earliest valid interpretation is used; timezones this
/// service is deployed in do not observe DST, so this is a formality.
pub fn cutoff_timestamp(date: NaiveDate, tz: Tz) -> i64 {
    let local = date.and_time(
        NaiveTime::from_hms_opt(CUTOFF_HOUR, 0, 0).unwrap_or(NaiveTime::MIN),
    );
    match tz.from_local_datetime(&local).earliest() {
        Some(dt) => dt.timestamp(),
        None => Utc.from_utc_datetime(&local).timestamp(),
    }
}

/// Analyze a single conversation transcript for the given analysis date.
pub fn analyze_conversation(
    items: &[TranscriptItem],
    date: NaiveDate,
    tz: Tz,
) -> ConversationMetrics {
    analyze_with_cutoff(items, cutoff_timestamp(date, tz))
}

/// Analyze a single conversation against an explicit cutoff timestamp.
pub fn analyze_with_cutoff(items: &[TranscriptItem], cutoff: i64) -> ConversationMetrics {
    if items.is_empty() {
        return ConversationMetrics::default();
    }

    // The API promises order, but sort defensively.
    let mut sorted: Vec<TranscriptItem> = items.to_vec();
    sorted.sort_by_key(|item| item.order);

    let mut turns = group_into_turns(sorted);

    // A leading salesperson turn is not a reply to anything.
    if turns
        .first()
        .map(|t| t.role == SpeakerRole::HostSalesman)
        .unwrap_or(false)
    {
        turns.remove(0);
    }

    // Set aside a trailing unanswered customer turn for new-rule handling.
    let unanswered_tail = match turns.last() {
        Some(t) if t.role == SpeakerRole::CustomerContact => turns.pop(),
        _ => None,
    };

    let mut metrics = main_pass(&turns);
    metrics.new_rule_customer_turn_count = metrics.customer_turn_count;

    if let Some(tail) = unanswered_tail {
        if tail.last_begin_time() < cutoff {
            // Last message before the cutoff: the salesperson had the rest of
            // the night to reply and did not.
            metrics.new_rule_customer_turn_count += 1;
            metrics.overtime_no_reply_count += 1;
        }
        // At or after the cutoff the turn is assumed still pending and is
        // excluded from both rules.
    }

    metrics
}

/// Merge consecutive same-role items into turns.
fn group_into_turns(items: Vec<TranscriptItem>) -> Vec<Turn> {
    let mut turns: Vec<Turn> = Vec::new();
    for item in items {
        match turns.last_mut() {
            Some(turn) if turn.role == item.entity_type => turn.items.push(item),
            _ => turns.push(Turn {
                role: item.entity_type,
                items: vec![item],
            }),
        }
    }
    turns
}

/// Old-rule pass: count customer turns and classify answered ones.
fn main_pass(turns: &[Turn]) -> ConversationMetrics {
    let mut metrics = ConversationMetrics::default();

    for (i, turn) in turns.iter().enumerate() {
        if turn.role != SpeakerRole::CustomerContact {
            continue;
        }
        metrics.customer_turn_count += 1;

        let Some(next) = turns.get(i + 1) else {
            continue;
        };
        if next.role != SpeakerRole::HostSalesman {
            continue;
        }

        let reply_duration = next.first_begin_time() - turn.last_begin_time();
        metrics.total_reply_duration += reply_duration;
        if reply_duration <= TIMELY_REPLY_THRESHOLD_SECS {
            metrics.timely_reply_count += 1;
        } else {
            metrics.overtime_reply_count += 1;
        }
    }

    metrics
}
