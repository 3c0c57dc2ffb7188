/*
 * Coolerd - monitor and control your cooling devices
 * Copyright (c) 2022-2024  Coolerd contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::collections::VecDeque;

use yata::methods::EMA;
use yata::prelude::Method;

pub const WINDOW_SIZE: u8 = 2; // 2 tested has good dynamic results
pub const SAMPLE_SIZE: isize = 4; // 4 sec. (4 samples of same temp to equal that temp 100%)

/// Sort, cleanup, and set safety levels for the given profile[(temp, duty)].
/// This will ensure that:
///   - the profile is a monotonically increasing function
///   - the profile is sorted
///   - duplicate temps are removed, keeping the largest duty
///   - duties are clamped to the channel's limits
///   - a (critical_temp, 100%) failsafe is enforced
///   - only the first profile step with the max duty is kept
pub fn normalize_profile(
    profile: &[(f64, u8)],
    critical_temp: u8,
    min_duty_value: u8,
    max_duty_value: u8,
) -> Vec<(u8, u8)> {
    let mut sorted_profile: VecDeque<(u8, u8)> = profile
        .iter()
        .map(|(temp, duty)| (temp.round() as u8, *duty))
        .collect();
    sorted_profile.push_back((critical_temp, max_duty_value));
    sorted_profile.make_contiguous().sort_by(
        |(temp_a, duty_a), (temp_b, duty_b)|
            // reverse ordering for duty so that the largest given duty value is used
            temp_a.cmp(temp_b).then(duty_b.cmp(duty_a)),
    );
    let mut normalized_profile = Vec::new();
    let first_step = sorted_profile
        .pop_front()
        .expect("profile can not be empty after the critical step was added");
    normalized_profile.push((first_step.0, first_step.1.clamp(min_duty_value, max_duty_value)));
    let (mut previous_temp, mut previous_duty) = normalized_profile[0];
    for (temp, duty) in sorted_profile {
        if temp == previous_temp {
            continue; // skip duplicate temps
        }
        let adjusted_duty = if duty < previous_duty {
            previous_duty // following duties are not allowed to decrease.
        } else {
            duty.clamp(min_duty_value, max_duty_value)
        };
        normalized_profile.push((temp, adjusted_duty));
        if adjusted_duty == max_duty_value {
            break;
        }
        previous_temp = temp;
        previous_duty = adjusted_duty;
    }
    normalized_profile
}

/// Interpolate duty from a given temp and profile(temp, duty)
/// profile must be normalized first for this function to work as expected
/// Returned duty is rounded to the nearest integer
pub fn interpolate_profile(normalized_profile: &[(u8, u8)], temp_f64: f64) -> u8 {
    let temp = temp_f64.round().clamp(0.0, f64::from(u8::MAX)) as u8;
    let mut step_below = &normalized_profile[0];
    let mut step_above = normalized_profile
        .last()
        .expect("normalized profiles always contain at least the critical step");
    for step in normalized_profile {
        if step.0 <= temp {
            step_below = step;
        }
        if step.0 >= temp {
            step_above = step;
            break;
        }
    }
    if step_below.0 == step_above.0 {
        return step_below.1; // temp matches exactly, no duty calculation needed
    }
    let (step_below_temp, step_below_duty) = (f64::from(step_below.0), f64::from(step_below.1));
    let (step_above_temp, step_above_duty) = (f64::from(step_above.0), f64::from(step_above.1));
    (step_below_duty
        + (f64::from(temp) - step_below_temp) / (step_above_temp - step_below_temp)
            * (step_above_duty - step_below_duty))
        .round() as u8
}

/// Computes an exponential moving average from the given temps and returns the
/// final/current value from that average.
/// The exponential moving average gives the most recent values more weight. This is
/// particularly helpful for setting duty for dynamic temperature sources like the CPU.
/// (Good reaction but also averaging)
/// Will panic if sample_size is 0.
/// Rounded to the nearest 100th decimal place
pub fn current_temp_from_exponential_moving_average(all_temps: &[f64]) -> f64 {
    (EMA::new_over(WINDOW_SIZE, get_temps_slice(all_temps))
        .expect("window size is non-zero")
        .last()
        .expect("temps should not be empty")
        * 100.)
        .round()
        / 100.
}

fn get_temps_slice(all_temps: &[f64]) -> &[f64] {
    // keeping the sample size low allows the average to be more aggressive,
    // otherwise the actual reading and the EMA take quite a while before they are the same value
    let sample_delta = all_temps.len() as isize - SAMPLE_SIZE;
    if sample_delta > 0 {
        all_temps.split_at(sample_delta as usize).1
    } else {
        all_temps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_profile_test() {
        let given_expected = vec![
            (
                (
                    vec![(30f64, 40u8), (25.0, 25), (35.0, 30), (40.0, 35), (40.0, 80)],
                    60u8,
                    0u8,
                    100u8,
                ),
                vec![(25u8, 25u8), (30, 40), (35, 40), (40, 80), (60, 100)],
            ),
            (
                (
                    vec![(30.0, 40), (25.0, 25), (35.0, 30), (40.0, 100)],
                    60,
                    0,
                    100,
                ),
                vec![(25, 25), (30, 40), (35, 40), (40, 100)],
            ),
            (
                (
                    vec![(30.0, 40), (25.0, 25), (35.0, 100), (40.0, 100)],
                    60,
                    0,
                    100,
                ),
                vec![(25, 25), (30, 40), (35, 100)],
            ),
            ((vec![], 60, 0, 100), vec![(60, 100)]),
            // duties below the channel minimum are lifted to it:
            ((vec![(20.0, 10)], 60, 20, 100), vec![(20, 20), (60, 100)]),
        ];

        for (given, expected) in given_expected {
            assert_eq!(
                normalize_profile(&given.0, given.1, given.2, given.3),
                expected
            );
        }
    }

    #[test]
    fn normalize_profile_canonical_example() {
        // duplicate temps keep the larger duty, monotone non-decreasing is
        // enforced and the critical step is pinned to 100:
        let given = vec![(50f64, 40u8), (30.0, 20), (50.0, 30), (60.0, 35)];
        assert_eq!(
            normalize_profile(&given, 100, 0, 100),
            vec![(30, 20), (50, 40), (60, 40), (100, 100)]
        );
    }

    #[test]
    fn normalize_profile_is_idempotent() {
        let given = vec![(50f64, 40u8), (30.0, 20), (50.0, 30), (60.0, 35)];
        let normalized = normalize_profile(&given, 100, 0, 100);
        let renormalized_input: Vec<(f64, u8)> = normalized
            .iter()
            .map(|(temp, duty)| (f64::from(*temp), *duty))
            .collect();
        assert_eq!(normalize_profile(&renormalized_input, 100, 0, 100), normalized);
    }

    #[test]
    fn interpolate_profile_test() {
        let given_expected = vec![
            ((vec![(20u8, 50u8), (50, 70), (60, 100)], 33.), 59u8),
            ((vec![(20, 50), (50, 70)], 19.), 50),
            ((vec![(20, 50), (50, 70)], 51.), 70),
            ((vec![(20, 50)], 20.), 50),
        ];
        for (given, expected) in given_expected {
            assert_eq!(interpolate_profile(&given.0, given.1), expected);
        }
    }

    #[test]
    fn interpolate_profile_canonical_example() {
        let profile = vec![(30u8, 20u8), (50, 40), (70, 80), (100, 100)];
        // linear between points: 20 + (45-30)*(40-20)/(50-30) = 35
        assert_eq!(interpolate_profile(&profile, 45.), 35);
        // below the first point and above the last:
        assert_eq!(interpolate_profile(&profile, 25.), 20);
        assert_eq!(interpolate_profile(&profile, 110.), 100);
    }

    #[test]
    fn interpolate_profile_stays_within_bounds_and_hits_points() {
        let profile = vec![(30u8, 20u8), (50, 40), (70, 80), (100, 100)];
        for temp in 0..=120 {
            let duty = interpolate_profile(&profile, f64::from(temp));
            assert!((20..=100).contains(&duty));
        }
        for (temp, duty) in &profile {
            assert_eq!(interpolate_profile(&profile, f64::from(*temp)), *duty);
        }
    }

    #[test]
    fn current_temp_from_exponential_moving_average_test() {
        let given_expected: Vec<(&[f64], f64)> = vec![
            (&[20., 25.], 23.33),
            (&[20., 25., 30.], 27.78),
            (&[20., 25., 30., 90.], 69.26),
            (&[20., 25., 30., 90., 90.], 83.15),
            (&[20., 25., 30., 90., 90., 90.], 87.78),
            (&[20., 25., 30., 90., 90., 90., 90.], 90.),
            (&[20., 25., 30., 90., 90., 90., 30.], 50.),
            (&[20., 25., 30., 90., 90., 90., 30., 30.], 36.67),
            (&[20., 25., 30., 90., 90., 90., 30., 30., 30.], 32.22),
            (&[20., 25., 30., 90., 90., 90., 30., 30., 30., 30.], 30.),
            (&[30., 30., 30., 30.], 30.),
        ];
        for (given, expected) in given_expected {
            assert_eq!(current_temp_from_exponential_moving_average(given), expected);
        }
    }
}
