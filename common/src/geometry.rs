use crate::config::TankGeometry;

pub fn to_level(distance_cm: f32, geometry: &TankGeometry) -> f32 {
    if !(geometry.height > 0.0) || distance_cm.is_nan() {
        return 0.0;
    }

    // The sensor sits `sensor_offset` above the full line.
    let nearest = geometry.sensor_offset;
    let farthest = geometry.height + geometry.sensor_offset;
    let distance = distance_cm.max(nearest).min(farthest);

    let level = geometry.height - (distance - geometry.sensor_offset);
    level.max(0.0).min(geometry.height)
}

pub fn to_volume(level_cm: f32, geometry: &TankGeometry, ceiling_l: u32) -> u32 {
    let liters = (geometry.length * geometry.width * level_cm / 1000.0).floor();
    if !(liters > 0.0) {
        return 0;
    }
    if liters >= ceiling_l as f32 {
        return ceiling_l;
    }
    liters as u32
}

pub fn capacity_liters(geometry: &TankGeometry) -> u32 {
    to_volume(geometry.height.max(0.0), geometry, u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CEILING: u32 = 2_000;

    fn tank() -> TankGeometry {
        TankGeometry {
            height: 100.0,
            length: 200.0,
            width: 100.0,
            sensor_offset: 20.0,
        }
    }

    #[test]
    fn mid_tank_reading() {
        let level = to_level(60.0, &tank());
        assert_eq!(level, 60.0);
        assert_eq!(to_volume(level, &tank(), CEILING), 1_200);
    }

    #[test]
    fn reading_past_the_bottom_is_empty() {
        let level = to_level(130.0, &tank());
        assert_eq!(level, 0.0);
        assert_eq!(to_volume(level, &tank(), CEILING), 0);
    }

    #[test]
    fn reading_inside_the_offset_is_full() {
        let level = to_level(5.0, &tank());
        assert_eq!(level, 100.0);
        assert_eq!(to_volume(level, &tank(), CEILING), 2_000);
        assert_eq!(to_volume(level, &tank(), 1_500), 1_500);
    }

    #[test]
    fn level_is_monotonic_and_bounded() {
        let geometry = tank();
        let mut previous = f32::INFINITY;
        for step in 0..=500 {
            let distance = step as f32 * 0.5;
            let level = to_level(distance, &geometry);
            assert!((0.0..=geometry.height).contains(&level));
            assert!(level <= previous, "level rose at {distance} cm");
            previous = level;
        }
    }

    #[test]
    fn volume_is_monotonic_and_bounded() {
        let geometry = TankGeometry {
            height: 180.0,
            ..tank()
        };
        let mut previous = 0;
        for step in -10..=400 {
            let level = step as f32 * 0.5;
            let volume = to_volume(level, &geometry, CEILING);
            assert!(volume <= CEILING);
            assert!(volume >= previous, "volume fell at {level} cm");
            previous = volume;
        }
        assert_eq!(previous, CEILING);
    }

    #[test]
    fn degenerate_geometry_reads_empty() {
        let flat = TankGeometry {
            height: 0.0,
            ..tank()
        };
        assert_eq!(to_level(50.0, &flat), 0.0);

        let inverted = TankGeometry {
            height: -20.0,
            ..tank()
        };
        assert_eq!(to_level(50.0, &inverted), 0.0);
        assert_eq!(to_level(f32::NAN, &tank()), 0.0);
    }

    #[test]
    fn capacity_ignores_ceiling() {
        let big = TankGeometry {
            height: 150.0,
            ..tank()
        };
        assert_eq!(capacity_liters(&tank()), 2_000);
        assert_eq!(capacity_liters(&big), 3_000);
    }
}
