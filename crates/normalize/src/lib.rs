use chrono::{DateTime, TimeZone, Utc};
use core_model::{ItemKind, MessageRecord, deterministic_id};
use serde_json::Value;

/// Upstream id for a raw item, synthesized when the source omitted one.
pub fn item_id(raw: &Value) -> String {
    match raw.get("item_id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => deterministic_id(&["item", &raw.to_string()]),
    }
}

/// Maps one raw feed item into the canonical record shape. Field extraction
/// is best-effort: anything missing or oddly shaped stays unset, and an
/// unrecognized `item_type` still yields a record with the common fields.
pub fn normalize_item(raw: &Value) -> MessageRecord {
    let kind = raw
        .get("item_type")
        .and_then(Value::as_str)
        .map(ItemKind::from)
        .unwrap_or_else(|| ItemKind::Other("unknown".to_string()));

    let mut rec = MessageRecord {
        id: item_id(raw),
        timestamp: extract_timestamp(raw),
        author_id: author_id(raw),
        kind: kind.clone(),
        text: str_field(raw, "text"),
        media_url: None,
        reel_code: None,
        reel_url: None,
        reel_thumbnail_url: None,
    };

    match kind {
        ItemKind::Clip => extract_clip(raw, &mut rec),
        ItemKind::Media => extract_media(raw, &mut rec),
        ItemKind::ReelShare => extract_reel_share(raw, &mut rec),
        ItemKind::XmaMediaShare => extract_xma_share(raw, &mut rec),
        _ => {}
    }

    // Last-resort link synthesis: only fills the gap a kind-specific
    // extractor left behind.
    if rec.reel_url.is_none()
        && let Some(code) = &rec.reel_code
    {
        rec.reel_url = Some(reel_url_from_code(code));
    }

    rec
}

pub fn reel_url_from_code(code: &str) -> String {
    format!("https://www.instagram.com/reels/{code}/")
}

fn post_url_from_code(code: &str) -> String {
    format!("https://www.instagram.com/p/{code}/")
}

fn extract_clip(raw: &Value, rec: &mut MessageRecord) {
    // The source nests the payload twice: clip.clip.{code, video_versions, ...}
    let Some(inner) = raw.get("clip").and_then(|c| c.get("clip")) else {
        return;
    };
    rec.reel_code = str_field(inner, "code");
    rec.reel_url = inner
        .get("video_versions")
        .and_then(Value::as_array)
        .and_then(|versions| versions.first())
        .and_then(|v| v.get("url"))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);
    rec.reel_thumbnail_url = thumbnail_url(inner);
}

fn extract_media(raw: &Value, rec: &mut MessageRecord) {
    let Some(media) = raw.get("media") else {
        return;
    };
    rec.media_url = str_field(media, "video_url")
        .or_else(|| {
            media
                .get("image_versions2")
                .and_then(|iv| iv.get("candidates"))
                .and_then(Value::as_array)
                .and_then(|c| c.first())
                .and_then(|c| c.get("url"))
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
        })
        .or_else(|| str_field(media, "code").map(|code| post_url_from_code(&code)));
}

fn extract_reel_share(raw: &Value, rec: &mut MessageRecord) {
    let Some(media) = raw.get("reel_share").and_then(|r| r.get("media")) else {
        return;
    };
    rec.reel_url = str_field(media, "video_url");
    rec.reel_code = str_field(media, "code");
    rec.reel_thumbnail_url = thumbnail_url(media);
}

fn extract_xma_share(raw: &Value, rec: &mut MessageRecord) {
    let Some(share) = raw.get("xma_share") else {
        return;
    };
    // The share payload arrives as either a bare object or a non-empty
    // list; in the list case only the first entry counts.
    let target = match share {
        Value::Array(entries) => entries.first(),
        Value::Object(_) => Some(share),
        _ => None,
    };
    let Some(target) = target else {
        return;
    };
    rec.reel_url = str_field(target, "target_url");
    rec.reel_thumbnail_url =
        str_field(target, "preview_url").or_else(|| str_field(target, "preview_url_large"));
}

/// Thumbnail from an `image_versions2.candidates` list, preferring the
/// second candidate when present: that slot holds the mid-sized rendition.
fn thumbnail_url(node: &Value) -> Option<String> {
    let candidates = node
        .get("image_versions2")?
        .get("candidates")?
        .as_array()?;
    let pick = if candidates.len() > 1 {
        &candidates[1]
    } else {
        candidates.first()?
    };
    pick.get("url")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}

fn extract_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    let micros = match raw.get("timestamp") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.parse::<i64>().ok(),
        _ => None,
    }?;
    Utc.timestamp_micros(micros).single()
}

fn author_id(raw: &Value) -> String {
    match raw.get("user_id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "unknown".to_string(),
    }
}

fn str_field(node: &Value, key: &str) -> Option<String> {
    node.get(key)
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
}
