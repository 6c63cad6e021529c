use image::{imageops, imageops::FilterType, GrayImage, RgbImage};

/// Default near-duplicate threshold. Deliberately permissive: high
/// sensitivity to edited copies at the cost of false positives. Exact-hash
/// matching remains the primary defense.
pub const DEFAULT_THRESHOLD: f32 = 0.3;

/// Perceptual similarity of `candidate` against `reference`.
///
/// Both bitmaps are reduced to luminance and the reference is resized to the
/// candidate's exact pixel dimensions (plain dimension match, not
/// aspect-preserving) so the two arrays line up for a direct per-pixel
/// normalized correlation coefficient. Returns `None` when either image has
/// zero area or zero variance; callers treat that as "no verdict".
pub fn score(candidate: &RgbImage, reference: &RgbImage) -> Option<f32> {
    let (w, h) = candidate.dimensions();
    if w == 0 || h == 0 || reference.width() == 0 || reference.height() == 0 {
        return None;
    }
    let cand = imageops::grayscale(candidate);
    let refer = imageops::resize(&imageops::grayscale(reference), w, h, FilterType::Triangle);
    zero_mean_ncc(&cand, &refer)
}

/// `true` iff the similarity score meets `threshold`. Unscorable pairs
/// report `false`: the near-duplicate check fails open.
pub fn is_near_duplicate(candidate: &RgbImage, reference: &RgbImage, threshold: f32) -> bool {
    match score(candidate, reference) {
        Some(s) => s >= threshold,
        None => false,
    }
}

/// Zero-mean normalized cross-correlation of two equally-sized luminance
/// maps: cov(a, b) / (sigma_a * sigma_b), in [-1, 1].
fn zero_mean_ncc(a: &GrayImage, b: &GrayImage) -> Option<f32> {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    let n = (a.width() * a.height()) as f64;
    if n == 0.0 {
        return None;
    }

    let mean = |img: &GrayImage| img.pixels().map(|p| p.0[0] as f64).sum::<f64>() / n;
    let (ma, mb) = (mean(a), mean(b));

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (pa, pb) in a.pixels().zip(b.pixels()) {
        let da = pa.0[0] as f64 - ma;
        let db = pb.0[0] as f64 - mb;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    let denom = (var_a * var_b).sqrt();
    if denom == 0.0 {
        // Constant image: the correlation coefficient is undefined.
        return None;
    }
    Some((cov / denom) as f32)
}
