//! Navigation of the source platform's internal GraphQL response shape:
//! `data.user.result.timeline.instructions[].entries[].content.itemContent
//! .tweet_results.result`, unwrapping `PostWithVisibilityResults`, and
//! picking the best media variant per attached entity.

use serde_json::Value;

use super::{MediaItem, Post};
use crate::state::MediaType;

pub fn extract_user_id(body: &Value) -> Option<String> {
    body.pointer("/data/user/result/rest_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub struct PageContent {
    pub posts: Vec<Post>,
    pub bottom_cursor: Option<String>,
}

pub fn extract_page(body: &Value) -> PageContent {
    let mut posts = Vec::new();
    let mut bottom_cursor = None;

    let instructions = body
        .pointer("/data/user/result/timeline/timeline/instructions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for instruction in &instructions {
        let entries = instruction
            .get("entries")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for entry in &entries {
            if let Some(cursor) = entry
                .pointer("/content/cursorType")
                .and_then(Value::as_str)
                .filter(|t| *t == "Bottom")
                .and_then(|_| entry.pointer("/content/value").and_then(Value::as_str))
            {
                bottom_cursor = Some(cursor.to_string());
                continue;
            }

            if let Some(post) = extract_post(entry) {
                posts.push(post);
            }
        }
    }

    PageContent {
        posts,
        bottom_cursor,
    }
}

fn extract_post(entry: &Value) -> Option<Post> {
    let result = entry.pointer("/content/itemContent/tweet_results/result")?;
    let typename = result.get("__typename").and_then(Value::as_str)?;

    let legacy = match typename {
        "Post" => result,
        "PostWithVisibilityResults" => result.get("tweet")?,
        _ => return None,
    };

    let id = legacy
        .get("rest_id")
        .and_then(Value::as_str)
        .map(str::to_string)?;
    let numeric_id: u64 = id.parse().ok()?;

    let media = extract_media(legacy);
    if media.is_empty() {
        return None;
    }

    Some(Post {
        id,
        numeric_id,
        media,
    })
}

fn extract_media(legacy: &Value) -> Vec<MediaItem> {
    let entities = legacy
        .pointer("/legacy/extended_entities/media")
        .or_else(|| legacy.pointer("/legacy/entities/media"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    entities
        .iter()
        .filter_map(extract_media_item)
        .collect()
}

fn extract_media_item(entity: &Value) -> Option<MediaItem> {
    let media_type = entity.get("type").and_then(Value::as_str)?;

    match media_type {
        "photo" => {
            let url = entity.get("media_url_https").and_then(Value::as_str)?;
            Some(MediaItem {
                url: format!("{url}?name=orig"),
                media_type: MediaType::Photo,
            })
        }
        "video" | "animated_gif" => {
            let variants = entity
                .pointer("/video_info/variants")
                .and_then(Value::as_array)?;

            let best = variants
                .iter()
                .filter(|v| v.get("content_type").and_then(Value::as_str) == Some("video/mp4"))
                .max_by_key(|v| v.get("bitrate").and_then(Value::as_u64).unwrap_or(0))?;

            let url = best.get("url").and_then(Value::as_str)?;
            let kind = if media_type == "animated_gif" {
                MediaType::Gif
            } else {
                MediaType::Video
            };

            Some(MediaItem {
                url: url.to_string(),
                media_type: kind,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn picks_highest_bitrate_mp4_variant() {
        let entity = json!({
            "type": "video",
            "video_info": {
                "variants": [
                    {"content_type": "video/mp4", "bitrate": 256000, "url": "low.mp4"},
                    {"content_type": "application/x-mpegURL", "url": "playlist.m3u8"},
                    {"content_type": "video/mp4", "bitrate": 832000, "url": "high.mp4"},
                ]
            }
        });
        let item = extract_media_item(&entity).unwrap();
        assert_eq!(item.url, "high.mp4");
        assert_eq!(item.media_type, MediaType::Video);
    }

    #[test]
    fn animated_gif_maps_to_gif_type() {
        let entity = json!({
            "type": "animated_gif",
            "video_info": {"variants": [{"content_type": "video/mp4", "bitrate": 0, "url": "g.mp4"}]}
        });
        let item = extract_media_item(&entity).unwrap();
        assert_eq!(item.media_type, MediaType::Gif);
    }

    #[test]
    fn post_with_no_usable_media_is_dropped() {
        let entry = json!({
            "content": {
                "itemContent": {
                    "tweet_results": {
                        "result": {
                            "__typename": "Post",
                            "rest_id": "1",
                            "legacy": {"entities": {"media": []}}
                        }
                    }
                }
            }
        });
        assert!(extract_post(&entry).is_none());
    }

    #[test]
    fn unwraps_visibility_results_wrapper() {
        let entry = json!({
            "content": {
                "itemContent": {
                    "tweet_results": {
                        "result": {
                            "__typename": "PostWithVisibilityResults",
                            "tweet": {
                                "rest_id": "42",
                                "legacy": {
                                    "extended_entities": {
                                        "media": [{"type": "photo", "media_url_https": "https://example.com/a.jpg"}]
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });
        let post = extract_post(&entry).unwrap();
        assert_eq!(post.id, "42");
        assert_eq!(post.media.len(), 1);
    }
}
