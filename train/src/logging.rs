//! Experiment logging toolkit.

use crate::{
    common::*,
    config::LoggingConfig,
    utils::{Throughput, ThroughputMeter},
    visualize::{draw_predictions, ImagePredictions},
};
use async_std::{fs::File, io::BufWriter};

pub use logging_message::*;
pub use logging_worker::*;
pub use sink::*;

mod sink {
    use super::*;

    /// Receives metrics and predictions of a run.
    ///
    /// Logging is fire-and-forget. A sink never fails the caller, and it may
    /// drop records it cannot deliver.
    pub trait ExperimentSink: Send + Sync {
        fn log_scalars(&self, step: i64, scalars: &[(String, f64)]);

        fn log_boxes(
            &self,
            step: i64,
            tag: &str,
            image_path: &Path,
            predictions: &ImagePredictions,
        );
    }

    /// Discards everything.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NullSink;

    impl ExperimentSink for NullSink {
        fn log_scalars(&self, _step: i64, _scalars: &[(String, f64)]) {}

        fn log_boxes(
            &self,
            _step: i64,
            _tag: &str,
            _image_path: &Path,
            _predictions: &ImagePredictions,
        ) {
        }
    }

    /// Forwards records to a [LoggingWorker] through a broadcast channel.
    #[derive(Debug, Clone)]
    pub struct EventSink {
        tx: broadcast::Sender<LoggingMessage>,
    }

    impl EventSink {
        pub fn new(tx: broadcast::Sender<LoggingMessage>) -> Self {
            Self { tx }
        }

        /// Creates a sink along with the receiver to be passed to
        /// [logging_worker].
        pub fn channel(capacity: usize) -> (Self, broadcast::Receiver<LoggingMessage>) {
            let (tx, rx) = broadcast::channel(capacity.max(1));
            (Self::new(tx), rx)
        }

        pub fn subscribe(&self) -> broadcast::Receiver<LoggingMessage> {
            self.tx.subscribe()
        }

        fn send(&self, msg: LoggingMessage) {
            let tag = msg.tag.clone();
            if self.tx.send(msg).is_err() {
                warn!("no logging worker is listening, dropping '{}'", tag);
            }
        }
    }

    impl ExperimentSink for EventSink {
        fn log_scalars(&self, step: i64, scalars: &[(String, f64)]) {
            self.send(LoggingMessage::new_scalars("scalars", step, scalars.to_vec()));
        }

        fn log_boxes(
            &self,
            step: i64,
            tag: &str,
            image_path: &Path,
            predictions: &ImagePredictions,
        ) {
            self.send(LoggingMessage::new_boxes(
                tag.to_string(),
                step,
                image_path,
                predictions.clone(),
            ));
        }
    }
}

mod logging_worker {
    use super::*;

    const REPORT_PERIOD: Duration = Duration::from_secs(60);

    /// Writes received records to TensorBoard event files.
    #[derive(Debug)]
    pub struct LoggingWorker {
        enable_images: bool,
        event_writer: EventAsyncWriter<BufWriter<File>>,
        throughput: ThroughputMeter,
        rx: broadcast::Receiver<LoggingMessage>,
    }

    impl LoggingWorker {
        /// Opens an event writer under `logging_dir/events`.
        async fn new(
            config: &LoggingConfig,
            logging_dir: &Path,
            rx: broadcast::Receiver<LoggingMessage>,
        ) -> Result<Self> {
            let event_dir = logging_dir.join("events");
            let event_path_prefix = event_dir
                .join("detr")
                .into_os_string()
                .into_string()
                .map_err(|path| format_err!("the path {:?} is not valid UTF-8", path))?;

            tokio::fs::create_dir_all(&event_dir).await?;

            let event_writer =
                EventAsyncWriter::from_prefix(event_path_prefix, "", EventWriterConfig::default())
                    .await?;

            Ok(Self {
                enable_images: config.enable_images,
                event_writer,
                throughput: ThroughputMeter::new(REPORT_PERIOD, Instant::now()),
                rx,
            })
        }

        /// Start the data logging worker. It stops when every sender is
        /// dropped.
        async fn start(mut self) -> Result<()> {
            loop {
                let LoggingMessage { tag, kind } = match self.rx.recv().await {
                    Ok(msg) => msg,
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        warn!("the logging worker lags behind, {} messages lost", count);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                match kind {
                    LoggingMessageKind::Scalars { step, scalars } => {
                        self.log_scalars(step, scalars).await?;
                    }
                    LoggingMessageKind::Boxes {
                        step,
                        image_path,
                        predictions,
                    } => {
                        self.log_boxes(&tag, step, image_path, predictions).await?;
                    }
                }

                if let Some(Throughput { scalars, images }) =
                    self.throughput.take(Instant::now())
                {
                    info!("logged {:.2} scalars/s, {:.2} images/s", scalars, images);
                }
            }

            self.event_writer.flush().await?;
            Ok(())
        }

        async fn log_scalars(&mut self, step: i64, scalars: Vec<(String, f64)>) -> Result<()> {
            self.throughput.count_scalars(scalars.len());
            for (name, value) in scalars {
                self.event_writer
                    .write_scalar(name, step, value as f32)
                    .await?;
            }
            Ok(())
        }

        async fn log_boxes(
            &mut self,
            tag: &str,
            step: i64,
            image_path: PathBuf,
            predictions: ImagePredictions,
        ) -> Result<()> {
            if !self.enable_images {
                return Ok(());
            }

            let image_name = image_path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("image")
                .to_string();

            // drawing is blocking work
            let image = {
                let image_path = image_path.clone();
                tokio::task::spawn_blocking(move || -> Result<_> {
                    let image = tch::vision::image::load(&image_path)?;
                    let image = image.to_kind(Kind::Float) / 255.0;
                    let color = Tensor::of_slice(&[1.0f32, 1.0, 0.0]);
                    let image = draw_predictions(&image, &predictions, 2, &color)?;
                    let image =
                        TchTensorAsImage::new(ColorSpace::Rgb, TchChannelOrder::CHW, image)?;
                    Ok(image)
                })
                .map(|result| Fallible::Ok(result??))
                .await
            };

            match image {
                Ok(image) => {
                    self.event_writer
                        .write_image(format!("{}/{}", tag, image_name), step, image)
                        .await?;
                    self.throughput.count_image();
                }
                Err(err) => {
                    warn!(
                        "failed to draw predictions on {}: {:#}",
                        image_path.display(),
                        err
                    );
                }
            }

            Ok(())
        }
    }

    /// Starts a [LoggingWorker] writing event files under `logging_dir`.
    ///
    /// The returned future finishes once every [EventSink] is dropped.
    pub async fn logging_worker(
        config: &LoggingConfig,
        logging_dir: &Path,
        rx: broadcast::Receiver<LoggingMessage>,
    ) -> Result<impl Future<Output = Result<()>> + Send> {
        let worker = LoggingWorker::new(config, logging_dir, rx).await?;
        Ok(tokio::task::spawn(worker.start()).map(|result| Fallible::Ok(result??)))
    }
}

mod logging_message {
    use super::*;

    /// The message type that is accepted by the logging worker.
    #[derive(Debug, Clone)]
    pub struct LoggingMessage {
        pub tag: Cow<'static, str>,
        pub kind: LoggingMessageKind,
    }

    impl LoggingMessage {
        pub fn new_scalars<S>(tag: S, step: i64, scalars: Vec<(String, f64)>) -> Self
        where
            S: Into<Cow<'static, str>>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::Scalars { step, scalars },
            }
        }

        pub fn new_boxes<S, P>(
            tag: S,
            step: i64,
            image_path: P,
            predictions: ImagePredictions,
        ) -> Self
        where
            S: Into<Cow<'static, str>>,
            P: AsRef<Path>,
        {
            Self {
                tag: tag.into(),
                kind: LoggingMessageKind::Boxes {
                    step,
                    image_path: image_path.as_ref().to_owned(),
                    predictions,
                },
            }
        }
    }

    #[derive(Debug, Clone)]
    pub enum LoggingMessageKind {
        /// Named scalars, written under their own names.
        Scalars {
            step: i64,
            scalars: Vec<(String, f64)>,
        },
        /// Predicted boxes drawn onto the image file.
        Boxes {
            step: i64,
            image_path: PathBuf,
            predictions: ImagePredictions,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visualize::{BoxGroup, BoxPosition, BoxRecord};

    #[test]
    fn event_sink_forwards_records() {
        let (sink, mut rx) = EventSink::channel(4);
        sink.log_scalars(3, &[("lr".to_string(), 1e-4), ("loss".to_string(), 2.5)]);
        sink.log_boxes(
            1,
            "predictions",
            Path::new("000000000001.jpg"),
            &ImagePredictions {
                predictions: BoxGroup { box_data: vec![] },
            },
        );

        let LoggingMessage { tag, kind } = rx.try_recv().unwrap();
        assert_eq!(tag, "scalars");
        match kind {
            LoggingMessageKind::Scalars { step, scalars } => {
                assert_eq!(step, 3);
                assert_eq!(scalars[1], ("loss".to_string(), 2.5));
            }
            other => panic!("unexpected message {:?}", other),
        }

        let LoggingMessage { tag, kind } = rx.try_recv().unwrap();
        assert_eq!(tag, "predictions");
        assert!(matches!(
            kind,
            LoggingMessageKind::Boxes { step: 1, ref image_path, .. }
                if image_path == Path::new("000000000001.jpg")
        ));
    }

    #[test]
    fn records_without_listener_are_dropped() {
        let (sink, rx) = EventSink::channel(1);
        drop(rx);
        sink.log_scalars(0, &[("loss".to_string(), 1.0)]);
        NullSink.log_scalars(0, &[("loss".to_string(), 1.0)]);
    }

    #[test]
    fn worker_writes_scalars_and_images_to_event_file() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("detr-train-events-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir)?;

        let image_path = dir.join("000000000001.png");
        let image = Tensor::ones(&[3, 16, 16], (Kind::Uint8, Device::Cpu)) * 128;
        tch::vision::image::save(&image, &image_path)?;
        let predictions = ImagePredictions {
            predictions: BoxGroup {
                box_data: vec![BoxRecord {
                    position: BoxPosition {
                        min_x: 0.25,
                        max_x: 0.75,
                        min_y: 0.25,
                        max_y: 0.75,
                    },
                    class_id: 1,
                    score: 0.9,
                    box_caption: "score: 0.9, class: person".to_string(),
                }],
            },
        };

        let config = LoggingConfig {
            dir: dir.clone(),
            enable_images: true,
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async {
            let (sink, rx) = EventSink::channel(8);
            let worker = logging_worker(&config, &dir, rx).await?;
            sink.log_scalars(1, &[("train_loss".to_string(), 2.5)]);
            sink.log_boxes(1, "predictions", &image_path, &predictions);
            drop(sink);
            worker.await?;
            Fallible::Ok(())
        })?;

        let pattern = format!("{}/events/detr*", dir.display());
        let files = glob::glob(&pattern)?.collect::<Result<Vec<_>, _>>()?;
        assert_eq!(files.len(), 1);
        assert!(fs::metadata(&files[0])?.len() > 0);
        Ok(())
    }
}
