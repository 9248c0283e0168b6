//! Fare estimate shown on offers when the passenger app did not supply one.

use crate::model::CarClass;

/// Base fare in currency units.
pub const BASE_FARE: f64 = 2.50;

/// Per-kilometer rate in currency units.
pub const PER_KM_RATE: f64 = 1.50;

fn class_multiplier(class: CarClass) -> f64 {
    match class {
        CarClass::Economy => 0.85,
        CarClass::Standard => 1.0,
        CarClass::Comfort => 1.3,
        CarClass::Van => 1.5,
    }
}

/// `fare = (BASE_FARE + distance_km * PER_KM_RATE) * class multiplier`,
/// rounded to cents.
pub fn estimate_fare(distance_km: f64, class: CarClass) -> f64 {
    let raw = (BASE_FARE + distance_km.max(0.0) * PER_KM_RATE) * class_multiplier(class);
    (raw * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fare_includes_base_and_distance() {
        let fare = estimate_fare(10.0, CarClass::Standard);
        assert!((fare - (BASE_FARE + 10.0 * PER_KM_RATE)).abs() < 0.01);
        assert!(estimate_fare(0.0, CarClass::Standard) >= BASE_FARE);
    }

    #[test]
    fn premium_classes_cost_more() {
        assert!(estimate_fare(5.0, CarClass::Van) > estimate_fare(5.0, CarClass::Standard));
        assert!(estimate_fare(5.0, CarClass::Economy) < estimate_fare(5.0, CarClass::Standard));
    }
}
