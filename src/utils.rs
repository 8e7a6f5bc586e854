use tracing::{info, warn};

/// Split a pixel-format symbol into its alphabetic base and bit depth,
/// e.g. `"BayerRG12"` into `("BayerRG", 12)`.
pub fn split_pixel_format(name: &str) -> Option<(&str, u32)> {
    let digits = name.find(|c: char| c.is_ascii_digit())?;
    let (base, depth) = name.split_at(digits);
    if base.is_empty() {
        return None;
    }
    Some((base, depth.parse().ok()?))
}

/// 8-bit variant of a pixel-format symbol and whether the device must be
/// switched to it.
pub fn eight_bit_variant(name: &str) -> Option<(String, bool)> {
    let (base, depth) = split_pixel_format(name)?;
    Some((format!("{base}8"), depth > 8))
}

/// Pin the calling thread to `core`, if that core exists.
pub fn pin_current_thread(core: usize) -> bool {
    let Some(cores) = core_affinity::get_core_ids() else {
        warn!("Unable to enumerate CPU cores; thread not pinned");
        return false;
    };
    match cores.into_iter().find(|c| c.id == core) {
        Some(id) if core_affinity::set_for_current(id) => {
            info!(core, "Pinned acquisition thread");
            true
        }
        _ => {
            warn!(core, "Unable to pin acquisition thread");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_base_and_depth() {
        assert_eq!(split_pixel_format("BayerRG12"), Some(("BayerRG", 12)));
        assert_eq!(split_pixel_format("Mono8"), Some(("Mono", 8)));
        assert_eq!(split_pixel_format("RGB8"), Some(("RGB", 8)));
        assert_eq!(split_pixel_format("YCbCr422_8"), None);
        assert_eq!(split_pixel_format("Mono"), None);
        assert_eq!(split_pixel_format("12"), None);
    }

    #[test]
    fn eight_bit_variant_only_rewrites_deeper_formats() {
        assert_eq!(
            eight_bit_variant("BayerGB12"),
            Some(("BayerGB8".to_owned(), true))
        );
        assert_eq!(eight_bit_variant("Mono8"), Some(("Mono8".to_owned(), false)));
        assert_eq!(eight_bit_variant("BayerRG10p"), None);
    }
}
