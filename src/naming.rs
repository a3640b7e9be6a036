//! Display-name assignment for flat listings.
//!
//! The directory front-end presents every non-trashed item in one flat
//! folder, so file-name collisions are routine (cameras love IMG_0001.jpg).
//! Colliding items all get a deterministic suffix derived from their dedup
//! key, so the assigned names never depend on listing order.

use std::collections::HashMap;

use crate::index::MediaItem;

/// Characters of the dedup key used for the suffix. Dedup keys are
/// URL-safe base64, so the prefix is filename-safe as-is.
const SUFFIX_LEN: usize = 8;

fn suffix_for(dedup_key: &str) -> &str {
    &dedup_key[..dedup_key.len().min(SUFFIX_LEN)]
}

/// Insert the dedup-key suffix before the extension:
/// `IMG_0001.jpg` + `AbCdEfGh...` becomes `IMG_0001.AbCdEfGh.jpg`.
pub fn disambiguated_name(file_name: &str, dedup_key: &str) -> String {
    let suffix = suffix_for(dedup_key);
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}.{suffix}.{ext}"),
        _ => format!("{file_name}.{suffix}"),
    }
}

/// Compute the display name for every item: unique file names pass through
/// unchanged, collisions are suffixed. Keyed by media key.
pub fn assign_display_names<'a, I>(items: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = &'a MediaItem> + Clone,
{
    let mut counts: HashMap<&str, u32> = HashMap::new();
    for item in items.clone() {
        *counts.entry(item.file_name.as_str()).or_default() += 1;
    }

    items
        .into_iter()
        .map(|item| {
            let name = if counts[item.file_name.as_str()] > 1 {
                disambiguated_name(&item.file_name, &item.dedup_key)
            } else {
                item.file_name.clone()
            };
            (item.media_key.clone(), name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MediaKind;

    fn item(key: &str, name: &str, dedup: &str) -> MediaItem {
        MediaItem::new(
            key.to_string(),
            name.to_string(),
            dedup.to_string(),
            MediaKind::Photo,
        )
    }

    #[test]
    fn unique_names_pass_through() {
        let items = vec![
            item("k1", "a.jpg", "dedupAAAA"),
            item("k2", "b.jpg", "dedupBBBB"),
        ];
        let names = assign_display_names(&items);
        assert_eq!(names["k1"], "a.jpg");
        assert_eq!(names["k2"], "b.jpg");
    }

    #[test]
    fn every_collision_member_gets_a_suffix() {
        let items = vec![
            item("k1", "IMG_0001.jpg", "AbCdEfGhIj"),
            item("k2", "IMG_0001.jpg", "ZyXwVuTsRq"),
            item("k3", "other.jpg", "QqQqQqQqQq"),
        ];
        let names = assign_display_names(&items);
        assert_eq!(names["k1"], "IMG_0001.AbCdEfGh.jpg");
        assert_eq!(names["k2"], "IMG_0001.ZyXwVuTs.jpg");
        assert_eq!(names["k3"], "other.jpg");
    }

    #[test]
    fn assignment_is_order_independent() {
        let forward = vec![
            item("k1", "dup.jpg", "firstKeyAA"),
            item("k2", "dup.jpg", "secondKeyB"),
        ];
        let reversed: Vec<_> = forward.iter().rev().cloned().collect();
        assert_eq!(assign_display_names(&forward), assign_display_names(&reversed));
    }

    #[test]
    fn suffix_lands_before_the_extension() {
        assert_eq!(
            disambiguated_name("movie.final.mp4", "KEYKEYKEYKEY"),
            "movie.final.KEYKEYKE.mp4"
        );
    }

    #[test]
    fn extensionless_names_get_a_trailing_suffix() {
        assert_eq!(disambiguated_name("README", "abcdefghij"), "README.abcdefgh");
    }

    #[test]
    fn dotfiles_are_not_split_at_the_leading_dot() {
        assert_eq!(disambiguated_name(".hidden", "abcdefghij"), ".hidden.abcdefgh");
    }

    #[test]
    fn short_dedup_keys_are_used_whole() {
        assert_eq!(disambiguated_name("a.jpg", "xy"), "a.xy.jpg");
    }
}
