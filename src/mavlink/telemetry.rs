//! Synthetic Simulator Telemetry
//!
//! Builds the per-step HIL message set sent to a simulated autopilot. There
//! is no vehicle dynamics here: the vehicle sits at a fixed position with a
//! slightly noised attitude and sensor readings.

use mavlink::ardupilotmega::{
    HilSensorUpdatedFlags, MavAutopilot, MavModeFlag, MavMessage, MavState, MavType,
    HEARTBEAT_DATA, HIL_GPS_DATA, HIL_RC_INPUTS_RAW_DATA, HIL_SENSOR_DATA,
    HIL_STATE_QUATERNION_DATA, SIM_STATE_DATA,
};
use nalgebra::UnitQuaternion;
use rand::Rng;

/// Relative noise amplitude applied to noised fields
pub const NOISE_FACTOR: f64 = 0.001;

/// Fixed home position
pub const HOME_LAT_DEG: f64 = 50.4549775;
pub const HOME_LON_DEG: f64 = 30.5195581;
pub const HOME_ALT_M: f32 = 150.0;

/// Sea-level standard pressure (hPa)
const GROUND_PRESSURE_HPA: f32 = 1013.25;
const GROUND_TEMPERATURE_C: f32 = 22.0;

/// Accel, gyro, mag, pressure, diff pressure, pressure alt and temperature
/// bits of `HIL_SENSOR_UPDATED_FLAGS`. The reset bit stays clear.
const ALL_SENSORS_UPDATED: u32 = 0x1FFF;

/// Number of messages produced per step
pub const STEP_MESSAGE_COUNT: usize = 5;

/// Message ids in emission order
#[cfg(test)]
pub const STEP_MESSAGE_IDS: [u32; STEP_MESSAGE_COUNT] = [113, 115, 92, 108, 107];

/// One step's worth of synthetic sensor state
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySnapshot {
    pub time_usec: u64,
    pub attitude: UnitQuaternion<f64>,
    pub eph: u16,
    pub epv: u16,
    pub mag: [f32; 3],
    pub abs_pressure: f32,
    pub diff_pressure: f32,
}

impl TelemetrySnapshot {
    /// Sample a new snapshot stamped with `time_usec`
    pub fn sample<R: Rng>(time_usec: u64, rng: &mut R) -> Self {
        let perturbation = UnitQuaternion::from_euler_angles(
            rng.gen::<f64>() * NOISE_FACTOR,
            rng.gen::<f64>() * NOISE_FACTOR,
            rng.gen::<f64>() * NOISE_FACTOR,
        );
        let attitude = UnitQuaternion::identity() * perturbation;

        let noise = NOISE_FACTOR as f32;
        Self {
            time_usec,
            attitude,
            eph: (70.0 * (1.0 + NOISE_FACTOR * rng.gen::<f64>())) as u16,
            epv: (110.0 * (1.0 + NOISE_FACTOR * rng.gen::<f64>())) as u16,
            mag: [
                noise * rng.gen::<f32>(),
                noise * rng.gen::<f32>(),
                noise * rng.gen::<f32>(),
            ],
            abs_pressure: GROUND_PRESSURE_HPA * (1.0 + noise * rng.gen::<f32>()),
            diff_pressure: 0.0,
        }
    }

    /// Attitude as `[w, x, y, z]`
    pub fn quaternion_wxyz(&self) -> [f32; 4] {
        let q = self.attitude.quaternion();
        [q.w as f32, q.i as f32, q.j as f32, q.k as f32]
    }

    /// Encode the snapshot as the ordered per-step message set
    pub fn to_messages(&self) -> [MavMessage; STEP_MESSAGE_COUNT] {
        let q = self.quaternion_wxyz();
        let (roll, pitch, yaw) = self.attitude.euler_angles();
        let lat_e7 = (HOME_LAT_DEG * 1e7).round() as i32;
        let lon_e7 = (HOME_LON_DEG * 1e7).round() as i32;
        let alt_mm = (HOME_ALT_M * 1000.0) as i32;

        [
            MavMessage::HIL_GPS(HIL_GPS_DATA {
                time_usec: self.time_usec,
                lat: lat_e7,
                lon: lon_e7,
                alt: alt_mm,
                eph: self.eph,
                epv: self.epv,
                vel: 3,
                vn: 0,
                ve: 0,
                vd: 0,
                cog: u16::MAX,
                fix_type: 0,
                satellites_visible: 30,
                ..Default::default()
            }),
            MavMessage::HIL_STATE_QUATERNION(HIL_STATE_QUATERNION_DATA {
                time_usec: self.time_usec,
                attitude_quaternion: q,
                lat: lat_e7,
                lon: lon_e7,
                alt: alt_mm,
                ..Default::default()
            }),
            MavMessage::HIL_RC_INPUTS_RAW(HIL_RC_INPUTS_RAW_DATA {
                time_usec: self.time_usec,
                rssi: u8::MAX,
                ..Default::default()
            }),
            MavMessage::SIM_STATE(SIM_STATE_DATA {
                q1: q[0],
                q2: q[1],
                q3: q[2],
                q4: q[3],
                roll: roll as f32,
                pitch: pitch as f32,
                yaw: yaw as f32,
                lat: HOME_LAT_DEG as f32,
                lon: HOME_LON_DEG as f32,
                alt: HOME_ALT_M,
                lat_int: lat_e7,
                lon_int: lon_e7,
                ..Default::default()
            }),
            MavMessage::HIL_SENSOR(HIL_SENSOR_DATA {
                time_usec: self.time_usec,
                xmag: self.mag[0],
                ymag: self.mag[1],
                zmag: self.mag[2],
                abs_pressure: self.abs_pressure,
                diff_pressure: self.diff_pressure,
                pressure_alt: HOME_ALT_M,
                temperature: GROUND_TEMPERATURE_C,
                fields_updated: HilSensorUpdatedFlags::from_bits_truncate(ALL_SENSORS_UPDATED),
                ..Default::default()
            }),
        ]
    }
}

/// Synthesize the telemetry set for one step
pub fn synthesize<R: Rng>(time_usec: u64, rng: &mut R) -> [MavMessage; STEP_MESSAGE_COUNT] {
    TelemetrySnapshot::sample(time_usec, rng).to_messages()
}

/// Fixed heartbeat the bridge answers every autopilot heartbeat with
pub fn heartbeat_reply() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_QUADROTOR,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_UNINIT,
        mavlink_version: 3,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::Message;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_step_messages_in_fixed_order() {
        let mut rng = StdRng::seed_from_u64(7);
        let messages = synthesize(1_000, &mut rng);

        let ids: Vec<u32> = messages.iter().map(|m| m.message_id()).collect();
        assert_eq!(ids, STEP_MESSAGE_IDS.to_vec());
        assert!(matches!(messages[0], MavMessage::HIL_GPS(_)));
        assert!(matches!(messages[1], MavMessage::HIL_STATE_QUATERNION(_)));
        assert!(matches!(messages[2], MavMessage::HIL_RC_INPUTS_RAW(_)));
        assert!(matches!(messages[3], MavMessage::SIM_STATE(_)));
        assert!(matches!(messages[4], MavMessage::HIL_SENSOR(_)));
    }

    #[test]
    fn test_attitude_stays_near_identity() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let snapshot = TelemetrySnapshot::sample(0, &mut rng);
            let [w, x, y, z] = snapshot.quaternion_wxyz();
            assert!(w > 0.999);
            assert!(x.abs() < 0.001 && y.abs() < 0.001 && z.abs() < 0.001);
            let norm = (w * w + x * x + y * y + z * z).sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_noised_fields_within_bounds() {
        let mut rng = StdRng::seed_from_u64(3);
        let snapshot = TelemetrySnapshot::sample(0, &mut rng);
        assert_eq!(snapshot.eph, 70);
        assert_eq!(snapshot.epv, 110);
        assert!(snapshot.abs_pressure >= GROUND_PRESSURE_HPA);
        assert!(snapshot.abs_pressure < GROUND_PRESSURE_HPA * 1.001 + 1e-3);
        assert!(snapshot.mag.iter().all(|m| (0.0..=0.001).contains(m)));
    }

    #[test]
    fn test_timestamps_and_position() {
        let mut rng = StdRng::seed_from_u64(5);
        let messages = synthesize(123_456, &mut rng);

        match &messages[0] {
            MavMessage::HIL_GPS(gps) => {
                assert_eq!(gps.time_usec, 123_456);
                assert_eq!(gps.lat, 504_549_775);
                assert_eq!(gps.alt, 150_000);
                assert_eq!(gps.satellites_visible, 30);
                assert_eq!(gps.cog, u16::MAX);
            }
            other => panic!("unexpected message: {:?}", other),
        }
        match &messages[3] {
            MavMessage::SIM_STATE(state) => {
                assert_eq!(state.lat_int, 504_549_775);
                assert_eq!(state.lon_int, 305_195_581);
            }
            other => panic!("unexpected message: {:?}", other),
        }
        match &messages[4] {
            MavMessage::HIL_SENSOR(sensor) => {
                assert_eq!(sensor.time_usec, 123_456);
                assert_eq!(sensor.fields_updated.bits(), ALL_SENSORS_UPDATED);
                assert_eq!(sensor.temperature, GROUND_TEMPERATURE_C);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_reply() {
        match heartbeat_reply() {
            MavMessage::HEARTBEAT(hb) => {
                assert_eq!(hb.mavtype, MavType::MAV_TYPE_QUADROTOR);
                assert_eq!(hb.autopilot, MavAutopilot::MAV_AUTOPILOT_INVALID);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
