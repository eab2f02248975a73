use color_eyre::eyre::{self as anyhow, Result};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
};
use tracing as log;

use blaster_core::{InputFrame, IoSerial, OutputFrame, DATATYPES_VERSION};

use super::codec::JsonLinesCodec;

/// Talk to the I/O board until `outputs_rx` is closed.
///
/// The board gets the freshest [OutputFrame] whenever it changes and reports
/// its switch levels (plus ESC telemetry, if any) as [InputFrame]s.
pub(crate) async fn run_io_board_loop<T>(
    serial_device: T,
    mut outputs_rx: watch::Receiver<OutputFrame>,
    inputs_tx: watch::Sender<InputFrame>,
    rpm_tx: watch::Sender<Option<u32>>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let framed = tokio_util::codec::Framed::new(serial_device, JsonLinesCodec::new());

    let (mut device_tx, mut device_rx) = framed.split();

    let (start_tx, mut start_rx) = tokio::sync::oneshot::channel();

    // Send request for the firmware version.
    let jh = tokio::spawn(async move {
        use tokio::sync::oneshot::error::TryRecvError;
        loop {
            match start_rx.try_recv() {
                Ok(()) => break,
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Closed) => {
                    anyhow::bail!("did not get version")
                }
            };
            device_tx.send(IoSerial::VersionRequest).await?;
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        Ok(device_tx)
    });

    // Check the firmware version is what we expect
    loop {
        let msg = device_rx
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("I/O board closed before version check"))?;
        match msg {
            Ok(IoSerial::VersionResponse(version)) => {
                if version != DATATYPES_VERSION {
                    anyhow::bail!(
                        "I/O board speaks version {version}, expected {DATATYPES_VERSION}"
                    );
                }
                start_tx
                    .send(())
                    .map_err(|_| anyhow::anyhow!("version request task ended early"))?;
                break;
            }
            Ok(other) => {
                log::error!("unexpected message: {other:?}");
            }
            Err(e) => {
                log::warn!("could not parse message from I/O board: {e}");
            }
        }
    }

    // Wait for the firmware version check to complete.
    let mut device_tx = jh.await??;
    log::info!("I/O board connected, version {DATATYPES_VERSION}");

    loop {
        tokio::select! {
            changed = outputs_rx.changed() => {
                if changed.is_err() {
                    log::debug!("output channel closed, leaving I/O loop");
                    return Ok(());
                }
                // hold lock on watch channel only briefly and not across `await`.
                let frame = *outputs_rx.borrow_and_update();
                log::trace!("sending outputs {frame:?}");
                // Send message, but timeout with error if it is not sent within one second.
                tokio::time::timeout(
                    std::time::Duration::from_secs(1),
                    device_tx.send(IoSerial::Set(frame)),
                )
                .await??;
            }
            msg = device_rx.next() => {
                let msg = msg.ok_or_else(|| anyhow::anyhow!("I/O board closed"))?;
                match msg {
                    Ok(IoSerial::Inputs(frame)) => {
                        rpm_tx.send_if_modified(|rpm| {
                            let changed = *rpm != frame.flywheel_rpm;
                            *rpm = frame.flywheel_rpm;
                            changed
                        });
                        inputs_tx.send_replace(frame);
                    }
                    Ok(other) => {
                        log::error!("unexpected message: {other:?}");
                    }
                    Err(e) => {
                        log::warn!("could not parse message from I/O board: {e}");
                    }
                }
            }
        }
    }
}

/// Stand-in for the board when none is attached. Inputs stay released.
pub(crate) async fn run_dry_run_loop(mut outputs_rx: watch::Receiver<OutputFrame>) -> Result<()> {
    while outputs_rx.changed().await.is_ok() {
        let frame = *outputs_rx.borrow_and_update();
        log::debug!("dry run outputs: {frame:?}");
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use blaster_core::{EscSignal, PusherPins, PwmDuration};
    use tokio_util::codec::Framed;

    use super::*;

    #[tokio::test]
    async fn handshake_then_exchange() -> Result<()> {
        let (host, board) = tokio::io::duplex(1024);
        let (outputs_tx, outputs_rx) = watch::channel(OutputFrame::default());
        let (inputs_tx, mut inputs_rx) = watch::channel(InputFrame::default());
        let (rpm_tx, mut rpm_rx) = watch::channel(None);
        let host_task = tokio::spawn(run_io_board_loop(host, outputs_rx, inputs_tx, rpm_tx));

        let mut board = Framed::new(board, JsonLinesCodec::new());
        let first = board.next().await.unwrap()?;
        assert_eq!(first, IoSerial::VersionRequest);
        board
            .send(IoSerial::VersionResponse(DATATYPES_VERSION))
            .await?;

        let pressed = InputFrame {
            trigger: true,
            flywheel_rpm: Some(31_000),
            ..Default::default()
        };
        board.send(IoSerial::Inputs(pressed)).await?;
        inputs_rx.changed().await?;
        assert_eq!(*inputs_rx.borrow_and_update(), pressed);
        rpm_rx.changed().await?;
        assert_eq!(*rpm_rx.borrow_and_update(), Some(31_000));

        let frame = OutputFrame {
            esc: EscSignal::Pwm(PwmDuration::new(1500)),
            pusher: PusherPins {
                pusher: true,
                brake: false,
            },
        };
        outputs_tx.send_replace(frame);
        // skip any version requests sent before the response arrived
        let received = loop {
            match tokio::time::timeout(Duration::from_secs(1), board.next()).await? {
                Some(Ok(IoSerial::VersionRequest)) => continue,
                Some(msg) => break msg?,
                None => anyhow::bail!("host closed"),
            }
        };
        assert_eq!(received, IoSerial::Set(frame));

        drop(outputs_tx);
        host_task.await??;
        Ok(())
    }

    #[tokio::test]
    async fn version_mismatch_is_an_error() {
        let (host, board) = tokio::io::duplex(1024);
        let (_outputs_tx, outputs_rx) = watch::channel(OutputFrame::default());
        let (inputs_tx, _inputs_rx) = watch::channel(InputFrame::default());
        let (rpm_tx, _rpm_rx) = watch::channel(None);
        let host_task = tokio::spawn(run_io_board_loop(host, outputs_rx, inputs_tx, rpm_tx));

        let mut board = Framed::new(board, JsonLinesCodec::new());
        board.next().await.unwrap().unwrap();
        board
            .send(IoSerial::VersionResponse(DATATYPES_VERSION + 1))
            .await
            .unwrap();
        let result = host_task.await.unwrap();
        assert!(result.is_err());
    }
}
