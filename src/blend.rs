// ============================================================================
// BLEND MODES – per-pixel colour math + Porter–Duff "over"
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    ColorDodge,
    ColorBurn,
    HardLight,
    SoftLight,
    Difference,
    Exclusion,
    Additive,
    Subtract,
}

impl BlendMode {
    /// Every mode, in stable code order.
    pub fn all() -> &'static [BlendMode] {
        &[
            BlendMode::Normal,
            BlendMode::Multiply,
            BlendMode::Screen,
            BlendMode::Overlay,
            BlendMode::Darken,
            BlendMode::Lighten,
            BlendMode::ColorDodge,
            BlendMode::ColorBurn,
            BlendMode::HardLight,
            BlendMode::SoftLight,
            BlendMode::Difference,
            BlendMode::Exclusion,
            BlendMode::Additive,
            BlendMode::Subtract,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            BlendMode::Normal => "Normal",
            BlendMode::Multiply => "Multiply",
            BlendMode::Screen => "Screen",
            BlendMode::Overlay => "Overlay",
            BlendMode::Darken => "Darken",
            BlendMode::Lighten => "Lighten",
            BlendMode::ColorDodge => "Color Dodge",
            BlendMode::ColorBurn => "Color Burn",
            BlendMode::HardLight => "Hard Light",
            BlendMode::SoftLight => "Soft Light",
            BlendMode::Difference => "Difference",
            BlendMode::Exclusion => "Exclusion",
            BlendMode::Additive => "Additive",
            BlendMode::Subtract => "Subtract",
        }
    }

    /// Stable code for binary serialization.
    pub fn to_u8(&self) -> u8 {
        Self::all().iter().position(|m| m == self).unwrap_or(0) as u8
    }

    /// Inverse of [`BlendMode::to_u8`]; unknown codes yield `None` so a
    /// loader can reject the file instead of silently changing the look.
    pub fn from_u8(v: u8) -> Option<Self> {
        Self::all().get(v as usize).copied()
    }
}

#[inline]
fn to_unit(v: u8) -> f32 {
    v as f32 / 255.0
}

#[inline]
fn to_byte(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Colour formula `B(base, top)` for one channel, all values in `[0, 1]`.
fn blend_channel(mode: BlendMode, base: f32, top: f32) -> f32 {
    match mode {
        BlendMode::Normal => top,
        BlendMode::Multiply => base * top,
        BlendMode::Screen => 1.0 - (1.0 - base) * (1.0 - top),
        BlendMode::Overlay => hard_light(top, base),
        BlendMode::Darken => base.min(top),
        BlendMode::Lighten => base.max(top),
        BlendMode::ColorDodge => {
            if base <= 0.0 {
                0.0
            } else if top >= 1.0 {
                1.0
            } else {
                (base / (1.0 - top)).min(1.0)
            }
        }
        BlendMode::ColorBurn => {
            if base >= 1.0 {
                1.0
            } else if top <= 0.0 {
                0.0
            } else {
                1.0 - ((1.0 - base) / top).min(1.0)
            }
        }
        BlendMode::HardLight => hard_light(base, top),
        BlendMode::SoftLight => soft_light(base, top),
        BlendMode::Difference => (base - top).abs(),
        BlendMode::Exclusion => base + top - 2.0 * base * top,
        BlendMode::Additive => (base + top).min(1.0),
        BlendMode::Subtract => (base - top).max(0.0),
    }
}

fn hard_light(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base * 2.0 * top
    } else {
        let t = 2.0 * top - 1.0;
        base + t - base * t
    }
}

/// W3C Soft Light formula.
fn soft_light(base: f32, top: f32) -> f32 {
    if top <= 0.5 {
        base - (1.0 - 2.0 * top) * base * (1.0 - base)
    } else {
        let d = if base <= 0.25 {
            ((16.0 * base - 12.0) * base + 4.0) * base
        } else {
            base.sqrt()
        };
        base + (2.0 * top - 1.0) * (d - base)
    }
}

/// Composite straight-alpha `top` over `base` with `mode` at `opacity`.
///
/// Separable W3C compositing: the mixed colour is
/// `(1 - αb)·Cs + αb·B(Cb, Cs)`, then Porter–Duff source-over with
/// `αs = top.a · opacity`. Deterministic: no dithering, round-to-nearest.
pub fn blend_pixel(base: [u8; 4], top: [u8; 4], mode: BlendMode, opacity: f32) -> [u8; 4] {
    // Fully transparent top pixel — nothing to blend
    if top[3] == 0 || opacity <= 0.0 {
        return base;
    }
    // Normal, full opacity, opaque top — just overwrite
    if mode == BlendMode::Normal && opacity >= 1.0 && top[3] == 255 {
        return top;
    }

    let opacity = opacity.clamp(0.0, 1.0);
    let ab = to_unit(base[3]);
    let at = to_unit(top[3]) * opacity;

    let out_a = at + ab * (1.0 - at);
    if out_a <= 0.0 {
        return [0, 0, 0, 0];
    }

    let mut out = [0u8; 4];
    for c in 0..3 {
        let cb = to_unit(base[c]);
        let ct = to_unit(top[c]);
        let mixed = (1.0 - ab) * ct + ab * blend_channel(mode, cb, ct);
        let v = (mixed * at + cb * ab * (1.0 - at)) / out_a;
        out[c] = to_byte(v);
    }
    out[3] = to_byte(out_a);
    out
}

/// Linear interpolation `from → to` by coverage `t` (0–255), all four channels.
/// Used for soft selection edges where an edit only partially replaces content.
#[inline]
pub fn lerp_pixel(from: [u8; 4], to: [u8; 4], t: u8) -> [u8; 4] {
    match t {
        0 => from,
        255 => to,
        _ => {
            let t = t as f32 / 255.0;
            let mix = |a: u8, b: u8| (a as f32 * (1.0 - t) + b as f32 * t).round() as u8;
            [mix(from[0], to[0]), mix(from[1], to[1]), mix(from[2], to[2]), mix(from[3], to[3])]
        }
    }
}
