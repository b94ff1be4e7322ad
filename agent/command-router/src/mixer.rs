//! Differential-drive mixing: joystick axes → wheel commands.

use adapter_trait::{ActuatorCommand, Axes};

/// Throttle from the left stick's Y axis, steering from the right stick's X axis.
pub fn mix_axes(axes: &Axes, max_throttle: f32) -> ActuatorCommand {
    mix(axes.left_y * max_throttle, axes.right_x, max_throttle)
}

/// Mix a scaled throttle and a steering value in [-1, 1].
///
/// Steering shifts power between the wheels in proportion to |throttle|, so
/// a stationary robot does not spin. In reverse the shift is mirrored so the
/// robot still turns toward the stick.
pub fn mix(throttle: f32, steering: f32, max_throttle: f32) -> ActuatorCommand {
    let t = round3(throttle);
    let shift = steering * t.abs();
    let (left, right) = if t > 0.0 { (t + shift, t - shift) } else { (t - shift, t + shift) };

    ActuatorCommand {
        throttle: t,
        steering,
        left:     round3(left.clamp(-max_throttle, max_throttle)),
        right:    round3(right.clamp(-max_throttle, max_throttle)),
    }
}

fn round3(v: f32) -> f32 {
    ((v as f64 * 1000.0).round() / 1000.0) as f32
}
