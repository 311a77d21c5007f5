//! The Chunker (C3): coalesce → sessionize → greedy-pack → format → finalize.
//!
//! Pure over its inputs — given the same Messages and config, re-running
//! this pipeline always yields the same Chunks with the same `chunk_id`s.
//! Cannot fail for well-formed input; an empty thread yields zero chunks.

use md5::Digest as Md5Digest;
use md5::Md5;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{ChunkingConfig, FormatConfig, QualityConfig, SizeConfig};
use crate::models::{Chunk, CoalescedMessage, Message, Session};
use crate::quality;
use crate::store::compute_content_hash;

const TOPIC_MARKERS: &[&str] = &[
    "btw",
    "anyways",
    "anyway",
    "a propos",
    "à propos",
    "speaking of",
    "by the way",
    "changing subject",
    "swoją drogą",
    "zmiana tematu",
    "na inny temat",
    "wracając do",
    "a tak w ogóle",
    "oh i jeszcze",
];

/// Runs the full pipeline over one thread's messages (already ordered by
/// `timestamp_ms` ascending, non-empty text) and a thread display name.
pub fn chunk_thread(
    thread_id: i64,
    thread_name: &str,
    messages: &[Message],
    cfg: &ChunkingConfig,
    quality_cfg: &QualityConfig,
) -> Vec<Chunk> {
    let coalesced = coalesce(messages, &cfg.coalesce);
    let sessions = sessionize(coalesced, &cfg.session);

    let mut chunks = Vec::new();
    for (session_idx, session) in sessions.into_iter().enumerate() {
        let packed = greedy_pack(&session, &cfg.size, &cfg.format);
        for (chunk_idx, acc) in packed.into_iter().enumerate() {
            chunks.push(finalize(
                thread_id,
                thread_name,
                session_idx as i64,
                chunk_idx as i64,
                acc,
                quality_cfg,
            ));
        }
    }
    chunks
}

fn char_len(s: &str) -> i64 {
    s.chars().count() as i64
}

/// Step A — Coalesce.
fn coalesce(messages: &[Message], cfg: &crate::config::CoalesceConfig) -> Vec<CoalescedMessage> {
    let mut out: Vec<CoalescedMessage> = Vec::new();
    let mut current: Option<CoalescedMessage> = None;

    for msg in messages {
        if let Some(acc) = current.as_mut() {
            let gap_seconds = (msg.timestamp_ms - acc.end_ts) as f64 / 1000.0;
            let combined_len = char_len(&acc.text) + char_len(&msg.text) + 1;
            let sender_changed = acc.sender_id != msg.sender_id;

            if sender_changed
                || gap_seconds > cfg.max_gap_seconds as f64
                || combined_len > cfg.max_combined_chars
            {
                out.push(current.take().unwrap());
            }
        }

        match current.as_mut() {
            Some(acc) => {
                acc.message_ids.push(msg.id.clone());
                acc.text.push('\n');
                acc.text.push_str(&msg.text);
                acc.end_ts = msg.timestamp_ms;
            }
            None => {
                current = Some(CoalescedMessage {
                    message_ids: vec![msg.id.clone()],
                    sender_id: msg.sender_id,
                    sender_name: msg.sender_name.clone(),
                    text: msg.text.clone(),
                    start_ts: msg.timestamp_ms,
                    end_ts: msg.timestamp_ms,
                });
            }
        }
    }
    if let Some(acc) = current.take() {
        out.push(acc);
    }
    out
}

/// Step B — Sessionize.
fn sessionize(coalesced: Vec<CoalescedMessage>, cfg: &crate::config::SessionConfig) -> Vec<Session> {
    let gap_threshold_ms = cfg.gap_minutes * 60 * 1000;
    let mut sessions: Vec<Session> = Vec::new();
    let mut current = Session::default();

    for entry in coalesced {
        if let Some(last) = current.entries.last() {
            let gap = entry.start_ts - last.end_ts;
            if gap > gap_threshold_ms {
                sessions.push(std::mem::take(&mut current));
            }
        }
        current.entries.push(entry);
    }
    if !current.entries.is_empty() {
        sessions.push(current);
    }
    sessions
}

/// Formats one coalesced message per Step D: prefixes each non-empty line
/// with `[Sender]: ` when enabled.
fn format_message(msg: &CoalescedMessage, cfg: &FormatConfig) -> String {
    if !cfg.sender_prefix {
        return msg.text.clone();
    }
    let sender = if msg.sender_name.trim().is_empty() {
        format!("User_{}", msg.sender_id)
    } else {
        msg.sender_name.clone()
    };
    msg.text
        .split('\n')
        .map(|line| {
            if line.is_empty() {
                line.to_string()
            } else {
                format!("[{}]: {}", sender, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Accumulator for the greedy-pack step, carrying enough state to finalize
/// a Chunk without re-walking its source messages.
struct ChunkAccumulator {
    text: String,
    entries: Vec<CoalescedMessage>,
    last_end_ts: i64,
}

impl ChunkAccumulator {
    fn utterance_count(&self) -> usize {
        self.entries.len()
    }
}

fn topic_marker_at_start(text: &str) -> bool {
    let prefix: String = text.chars().take(50).collect();
    let trimmed = prefix.trim_start_matches(|c: char| {
        c.is_whitespace() || matches!(c, '"' | '\'' | '.' | ',' | '!' | '?' | ';' | ':' | '-' | '–' | '—' | '(' | '[')
    });
    let lower = trimmed.to_lowercase();
    TOPIC_MARKERS.iter().any(|marker| lower.starts_with(marker))
}

static URL_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bhttps?://[^\s]+").unwrap());

fn contains_url_short(text: &str) -> bool {
    char_len(text) < 200 && URL_PATTERN.is_match(text)
}

fn should_split(acc: &ChunkAccumulator, next: &CoalescedMessage, size_cfg: &SizeConfig, format_cfg: &FormatConfig) -> bool {
    let next_formatted = format_message(next, format_cfg);
    let candidate_len = char_len(&acc.text) + 1 + char_len(&next_formatted);

    // 1. Hard size.
    if candidate_len > size_cfg.max_chars {
        return true;
    }

    // 2. Target reached.
    if char_len(&acc.text) >= size_cfg.target_chars && acc.utterance_count() >= 2 {
        return true;
    }

    // 3. Intra-session gap.
    let gap_ms = next.start_ts - acc.last_end_ts;
    if gap_ms > 20 * 60 * 1000 && acc.utterance_count() >= 2 {
        return true;
    }

    // 4. Topic marker.
    if topic_marker_at_start(&next.text) {
        return true;
    }

    // 5. URL-bearing short message.
    if contains_url_short(&next.text) {
        return true;
    }

    false
}

/// Step C — Greedy pack, per session.
fn greedy_pack(session: &Session, size_cfg: &SizeConfig, format_cfg: &FormatConfig) -> Vec<ChunkAccumulator> {
    let mut out = Vec::new();
    let mut acc: Option<ChunkAccumulator> = None;

    for msg in &session.entries {
        match acc.as_mut() {
            None => {
                acc = Some(ChunkAccumulator {
                    text: format_message(msg, format_cfg),
                    entries: vec![msg.clone()],
                    last_end_ts: msg.end_ts,
                });
            }
            Some(a) => {
                if should_split(a, msg, size_cfg, format_cfg) {
                    out.push(acc.take().unwrap());
                    acc = Some(ChunkAccumulator {
                        text: format_message(msg, format_cfg),
                        entries: vec![msg.clone()],
                        last_end_ts: msg.end_ts,
                    });
                } else {
                    let a = acc.as_mut().unwrap();
                    a.text.push('\n');
                    a.text.push_str(&format_message(msg, format_cfg));
                    a.entries.push(msg.clone());
                    a.last_end_ts = msg.end_ts;
                }
            }
        }
    }
    if let Some(a) = acc.take() {
        out.push(a);
    }
    out
}

/// Step E — Finalize: compute chunk_id, aggregate participants/message ids,
/// compute counts, decide indexability, fill content_hash.
fn finalize(
    thread_id: i64,
    thread_name: &str,
    session_idx: i64,
    chunk_idx: i64,
    acc: ChunkAccumulator,
    quality_cfg: &QualityConfig,
) -> Chunk {
    let start_ts = acc.entries.first().map(|e| e.start_ts).unwrap_or(0);
    let end_ts = acc.entries.last().map(|e| e.end_ts).unwrap_or(start_ts);

    let chunk_id = compute_chunk_id(thread_id, session_idx, chunk_idx, start_ts);

    let mut message_ids = Vec::new();
    let mut participant_ids = Vec::new();
    let mut participant_names = Vec::new();
    let mut seen_participants = std::collections::HashSet::new();

    for entry in &acc.entries {
        message_ids.extend(entry.message_ids.iter().cloned());
        if seen_participants.insert(entry.sender_id) {
            participant_ids.push(entry.sender_id);
            let name = if entry.sender_name.trim().is_empty() {
                format!("User_{}", entry.sender_id)
            } else {
                entry.sender_name.clone()
            };
            participant_names.push(name);
        }
    }

    let metrics = quality::measure(&acc.text);
    let is_indexable = quality::is_indexable(&acc.text, quality_cfg);

    let mut chunk = Chunk {
        chunk_id,
        thread_id,
        thread_name: thread_name.to_string(),
        session_idx,
        chunk_idx,
        message_ids,
        participant_ids,
        participant_names,
        text: acc.text,
        start_ts,
        end_ts,
        message_count: acc.entries.len() as i64,
        is_indexable,
        char_count: metrics.char_count,
        alnum_count: metrics.alnum_count,
        unique_word_count: metrics.unique_word_count,
        content_hash: String::new(),
        vector_synced: false,
    };
    chunk.content_hash = compute_content_hash(&chunk);
    chunk
}

fn compute_chunk_id(thread_id: i64, session_idx: i64, chunk_idx: i64, start_ts: i64) -> String {
    let input = format!("{}_{}_{}_{}", thread_id, session_idx, chunk_idx, start_ts);
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkingConfig;

    fn msg(id: &str, thread_id: i64, sender_id: i64, sender_name: &str, text: &str, ts: i64) -> Message {
        Message {
            id: id.to_string(),
            thread_id,
            sender_id,
            sender_name: sender_name.to_string(),
            text: text.to_string(),
            timestamp_ms: ts,
        }
    }

    #[test]
    fn empty_thread_yields_no_chunks() {
        let cfg = ChunkingConfig::default();
        let quality_cfg = QualityConfig::default();
        let chunks = chunk_thread(1, "Alpha", &[], &cfg, &quality_cfg);
        assert!(chunks.is_empty());
    }

    #[test]
    fn chunk_id_is_deterministic() {
        let cfg = ChunkingConfig::default();
        let quality_cfg = QualityConfig::default();
        let messages = vec![
            msg("m1", 1, 10, "Alice", "hello there friend", 0),
            msg("m2", 1, 20, "Bob", "hi Alice, good to hear from you", 1000),
        ];
        let a = chunk_thread(1, "Alpha", &messages, &cfg, &quality_cfg);
        let b = chunk_thread(1, "Alpha", &messages, &cfg, &quality_cfg);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.chunk_id, y.chunk_id);
            assert_eq!(x.content_hash, y.content_hash);
        }
    }

    // S1: unicode coalesce limit.
    #[test]
    fn s1_coalesce_respects_unicode_code_point_limit() {
        let mut cfg = ChunkingConfig::default();
        cfg.coalesce.max_combined_chars = 5;
        let messages = vec![
            msg("m1", 1, 1, "Alice", "😀", 0),
            msg("m2", 1, 1, "Alice", "😀", 1000),
        ];
        let coalesced = coalesce(&messages, &cfg.coalesce);
        assert_eq!(coalesced.len(), 1);
        assert_eq!(coalesced[0].text, "😀\n😀");
        assert_eq!(char_len(&coalesced[0].text), 3);
    }

    // S2: session split at exactly the threshold.
    #[test]
    fn s2_session_splits_on_exceeding_gap() {
        let cfg = ChunkingConfig::default();
        let messages = vec![
            msg("m1", 1, 1, "Alice", "hello", 0),
            msg("m2", 1, 1, "Alice", "are you there", 46 * 60 * 1000),
        ];
        let coalesced = coalesce(&messages, &cfg.coalesce);
        let sessions = sessionize(coalesced, &cfg.session);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].entries.len(), 1);
        assert_eq!(sessions[1].entries.len(), 1);
    }

    #[test]
    fn session_gap_of_exactly_threshold_does_not_split() {
        let cfg = ChunkingConfig::default();
        let messages = vec![
            msg("m1", 1, 1, "Alice", "hello", 0),
            msg("m2", 1, 1, "Alice", "you still there", 45 * 60 * 1000),
        ];
        let coalesced = coalesce(&messages, &cfg.coalesce);
        let sessions = sessionize(coalesced, &cfg.session);
        assert_eq!(sessions.len(), 1);
    }

    // S3: greedy chunk splits on topic marker.
    #[test]
    fn s3_greedy_pack_splits_on_topic_marker() {
        let mut cfg = ChunkingConfig::default();
        // Must exceed "[Alice]: word..." + "[Bob]: word..." combined (115 chars)
        // so rule 2 doesn't split before the topic marker is ever seen at m4.
        cfg.size.target_chars = 150;
        cfg.size.max_chars = 10_000;
        cfg.coalesce.max_combined_chars = 10_000;

        let long_text = "word ".repeat(10);
        let messages = vec![
            msg("m1", 1, 1, "Alice", long_text.trim(), 0),
            msg("m2", 1, 2, "Bob", long_text.trim(), 60_000),
            msg("m3", 1, 1, "Alice", long_text.trim(), 120_000),
            msg("m4", 1, 2, "Bob", "BTW, quick question about tomorrow", 180_000),
            msg("m5", 1, 1, "Alice", "sure, what's up", 240_000),
        ];

        let coalesced = coalesce(&messages, &cfg.coalesce);
        let sessions = sessionize(coalesced, &cfg.session);
        assert_eq!(sessions.len(), 1);
        let packed = greedy_pack(&sessions[0], &cfg.size, &cfg.format);
        assert_eq!(packed.len(), 2);
        assert_eq!(packed[0].entries.len(), 3);
        assert_eq!(packed[1].entries.len(), 2);
    }

    #[test]
    fn chunk_idx_strictly_increasing_within_session() {
        let cfg = ChunkingConfig::default();
        let quality_cfg = QualityConfig::default();
        let mut messages = Vec::new();
        for i in 0..30 {
            messages.push(msg(
                &format!("m{}", i),
                1,
                (i % 2) as i64,
                if i % 2 == 0 { "Alice" } else { "Bob" },
                "this is a moderately long message meant to force packing across several chunks when repeated enough times over a session",
                i as i64 * 1000,
            ));
        }
        let chunks = chunk_thread(1, "Alpha", &messages, &cfg, &quality_cfg);
        let mut last_idx: Option<i64> = None;
        for c in &chunks {
            if let Some(prev) = last_idx {
                assert_eq!(c.chunk_idx, prev + 1);
            } else {
                assert_eq!(c.chunk_idx, 0);
            }
            last_idx = Some(c.chunk_idx);
        }
    }

    #[test]
    fn format_prefixes_sender_on_nonempty_lines() {
        let cfg = FormatConfig { sender_prefix: true };
        let m = CoalescedMessage {
            message_ids: vec!["m1".into()],
            sender_id: 1,
            sender_name: "Alice".into(),
            text: "line one\n\nline two".into(),
            start_ts: 0,
            end_ts: 0,
        };
        let formatted = format_message(&m, &cfg);
        assert_eq!(formatted, "[Alice]: line one\n\n[Alice]: line two");
    }
}
