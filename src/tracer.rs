//! Telemetry tracer
//!
//! Listens on a MAVLink endpoint and logs the simulator-related messages an
//! autopilot reports back, which makes it easy to check what the autopilot
//! made of the synthetic telemetry.

use anyhow::{Context, Result};
use mavlink::ardupilotmega::MavMessage;
use mavlink::error::MessageReadError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Label for messages worth tracing, `None` for everything else
pub fn trace_label(message: &MavMessage) -> Option<&'static str> {
    let label = match message {
        MavMessage::HIL_SENSOR(_) => "HIL sensor",
        MavMessage::HIL_STATE_QUATERNION(_) => "HIL state quaternion",
        MavMessage::GPS_RAW_INT(_) => "Raw GPS",
        MavMessage::ATTITUDE_QUATERNION(_) => "Attitude quaternion",
        MavMessage::HIGHRES_IMU(_) => "High resolution IMU",
        MavMessage::RAW_IMU(_) => "Raw IMU",
        MavMessage::SCALED_IMU(_) | MavMessage::SCALED_IMU2(_) | MavMessage::SCALED_IMU3(_) => {
            "Scaled IMU"
        }
        MavMessage::SYS_STATUS(_) => "System status",
        MavMessage::RAW_PRESSURE(_) => "Raw pressure",
        MavMessage::SCALED_PRESSURE(_) => "Scaled pressure",
        _ => return None,
    };
    Some(label)
}

/// Trace messages arriving at `address` until `shutdown` fires
pub async fn run(address: &str, shutdown: CancellationToken) -> Result<()> {
    let connection = mavlink::connect_async::<MavMessage>(address)
        .await
        .with_context(|| format!("open tracer endpoint {}", address))?;

    info!("Tracer listening on {}", address);

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = connection.recv() => received,
        };

        match received {
            Ok((header, message)) => {
                if let Some(label) = trace_label(&message) {
                    info!(
                        system_id = header.system_id,
                        component_id = header.component_id,
                        "{}: {:?}",
                        label,
                        message
                    );
                }
            }
            Err(MessageReadError::Io(e)) => {
                return Err(e).context("tracer endpoint read failed");
            }
            Err(e) => debug!("Skipping unreadable frame: {}", e),
        }
    }

    info!("Tracer stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::ardupilotmega::{
        ATTITUDE_QUATERNION_DATA, HEARTBEAT_DATA, HIL_ACTUATOR_CONTROLS_DATA, HIL_SENSOR_DATA,
        SCALED_IMU2_DATA, SCALED_IMU3_DATA, SCALED_IMU_DATA, SYS_STATUS_DATA,
    };

    #[test]
    fn test_simulator_messages_are_traced() {
        assert_eq!(
            trace_label(&MavMessage::HIL_SENSOR(HIL_SENSOR_DATA::default())),
            Some("HIL sensor")
        );
        assert_eq!(
            trace_label(&MavMessage::ATTITUDE_QUATERNION(ATTITUDE_QUATERNION_DATA::default())),
            Some("Attitude quaternion")
        );
        assert_eq!(
            trace_label(&MavMessage::SYS_STATUS(SYS_STATUS_DATA::default())),
            Some("System status")
        );
    }

    #[test]
    fn test_all_scaled_imus_share_a_label() {
        let labels = [
            trace_label(&MavMessage::SCALED_IMU(SCALED_IMU_DATA::default())),
            trace_label(&MavMessage::SCALED_IMU2(SCALED_IMU2_DATA::default())),
            trace_label(&MavMessage::SCALED_IMU3(SCALED_IMU3_DATA::default())),
        ];
        assert!(labels.iter().all(|l| *l == Some("Scaled IMU")));
    }

    #[test]
    fn test_other_messages_are_ignored() {
        assert_eq!(trace_label(&MavMessage::HEARTBEAT(HEARTBEAT_DATA::default())), None);
        assert_eq!(
            trace_label(&MavMessage::HIL_ACTUATOR_CONTROLS(
                HIL_ACTUATOR_CONTROLS_DATA::default()
            )),
            None
        );
    }

    #[tokio::test]
    async fn test_bad_address_fails() {
        let result = run("bogus:nowhere", CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        run("udpin:127.0.0.1:0", shutdown).await.unwrap();
    }
}
