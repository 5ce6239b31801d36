use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::appearance::{AppearanceDescriptor, AppearanceMatcher, MatcherMode};
use crate::config::SessionConfig;
use crate::detection::{detect_records, DetectionRecord, Detector, TrackId};
use crate::enhance::enhance_low_light;
use crate::rendering::{apply_focus, FocusMode, Overlay};
use crate::tracking::{
    acquire_reference, resolve_click, resolve_target, Resolution, Resolved, Selection, SelectionError,
    TargetLock,
};
use crate::video::RgbFrame;

const TIMING_INTERVAL: u64 = 300;

/// Everything the cascade learned about one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    /// The frame detection and matching ran on (enhanced when low-light is on).
    pub frame: RgbFrame,
    pub detections: Vec<DetectionRecord>,
    pub resolved: Option<Resolved>,
    /// Lock identity after this frame.
    pub identity: Option<TrackId>,
}

impl Analysis {
    pub fn is_locked(&self) -> bool {
        self.identity.is_some()
    }
}

pub struct Analyzer {
    detector: Box<dyn Detector>,
    matcher: AppearanceMatcher,
    prof_frames: u64,
    prof_enhance: Duration,
    prof_detect: Duration,
    prof_track: Duration,
}

impl Analyzer {
    pub fn new(detector: Box<dyn Detector>, matcher: AppearanceMatcher) -> Self {
        Self {
            detector,
            matcher,
            prof_frames: 0,
            prof_enhance: Duration::ZERO,
            prof_detect: Duration::ZERO,
            prof_track: Duration::ZERO,
        }
    }

    pub fn matcher(&self) -> &AppearanceMatcher {
        &self.matcher
    }

    /// Run enhancement, detection and the lock cascade for one frame.
    pub fn analyze(
        &mut self,
        frame: &RgbFrame,
        config: &SessionConfig,
        lock: &mut TargetLock,
        reference: Option<&AppearanceDescriptor>,
    ) -> Analysis {
        let enhance_start = Instant::now();
        let frame = if config.low_light {
            enhance_low_light(frame)
        } else {
            frame.clone()
        };
        self.prof_enhance += enhance_start.elapsed();

        let detect_start = Instant::now();
        let detections = detect_records(self.detector.as_mut(), &frame);
        self.prof_detect += detect_start.elapsed();

        let track_start = Instant::now();
        let matcher = config.appearance_match.then_some(&self.matcher);
        let resolved = match (lock.is_locked(), reference, matcher) {
            (false, Some(reference), Some(matcher)) => {
                let acquired = acquire_reference(lock, &frame, &detections, config, matcher, reference);
                if let Some(found) = &acquired {
                    info!(track_id = ?lock.identity(), score = ?found.similarity, "locked onto reference");
                }
                acquired
            }
            _ => resolve_target(lock, &frame, &detections, config, matcher),
        };
        self.prof_track += track_start.elapsed();

        debug!(
            pts = frame.pts,
            detections = detections.len(),
            via = ?resolved.map(|r| r.via),
            identity = ?lock.identity(),
            "frame analyzed"
        );

        self.prof_frames += 1;
        if self.prof_frames % TIMING_INTERVAL == 0 {
            let per_frame = |d: Duration| format!("{:.2}", d.as_secs_f64() * 1000.0 / self.prof_frames as f64);
            info!(
                frames = self.prof_frames,
                enhance_ms_per_frame = per_frame(self.prof_enhance),
                detect_ms_per_frame = per_frame(self.prof_detect),
                track_ms_per_frame = per_frame(self.prof_track),
                "pipeline analyze timings"
            );
        }

        Analysis {
            frame,
            detections,
            resolved,
            identity: lock.identity(),
        }
    }
}

pub struct Renderer {
    overlay: Overlay,
    prof_frames: u64,
    prof_render: Duration,
}

impl Renderer {
    pub fn new(overlay: Overlay) -> Self {
        Self {
            overlay,
            prof_frames: 0,
            prof_render: Duration::ZERO,
        }
    }

    /// Composite the analyzed frame. While nothing is locked the frame passes
    /// through unblurred so the user can see what to select.
    pub fn render(&mut self, analysis: &Analysis, config: &SessionConfig) -> RgbFrame {
        let render_start = Instant::now();
        let mut out = if analysis.is_locked() {
            let mode = FocusMode::from_soft_flag(config.soft_focus);
            apply_focus(&analysis.frame, analysis.resolved.map(|r| r.bbox), mode)
        } else {
            analysis.frame.clone()
        };
        if config.show_boxes {
            self.overlay.draw(&mut out, &analysis.detections);
        }
        self.prof_render += render_start.elapsed();

        self.prof_frames += 1;
        if self.prof_frames % TIMING_INTERVAL == 0 {
            info!(
                frames = self.prof_frames,
                render_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_render.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                "pipeline render timings"
            );
        }
        out
    }
}

/// What the host gets back for each processed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutput {
    pub frame: RgbFrame,
    pub identity: Option<TrackId>,
    /// `None` while appearance matching is disabled.
    pub matcher_mode: Option<MatcherMode>,
    pub analysis: Analysis,
}

/// One focus session: configuration, the lock, and the stages that act on it.
pub struct Session {
    config: SessionConfig,
    analyzer: Analyzer,
    renderer: Renderer,
    lock: TargetLock,
    reference: Option<AppearanceDescriptor>,
    last: Option<Analysis>,
}

impl Session {
    pub fn new(config: SessionConfig, detector: Box<dyn Detector>, matcher: AppearanceMatcher) -> Self {
        Self::with_overlay(config, detector, matcher, Overlay::new())
    }

    pub fn with_overlay(
        config: SessionConfig,
        detector: Box<dyn Detector>,
        matcher: AppearanceMatcher,
        overlay: Overlay,
    ) -> Self {
        info!(mode = %matcher.mode(), "focus session created");
        Self {
            config: config.sanitized(),
            analyzer: Analyzer::new(detector, matcher),
            renderer: Renderer::new(overlay),
            lock: TargetLock::new(),
            reference: None,
            last: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Replace the configuration; thresholds are re-derived from it on the
    /// next frame. The lock is untouched.
    pub fn set_config(&mut self, config: SessionConfig) {
        self.config = config.sanitized();
    }

    pub fn lock(&self) -> &TargetLock {
        &self.lock
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn matcher_mode(&self) -> Option<MatcherMode> {
        self.config
            .appearance_match
            .then(|| self.analyzer.matcher().mode())
    }

    pub fn matcher(&self) -> &AppearanceMatcher {
        self.analyzer.matcher()
    }

    /// Arm automatic acquisition: while unlocked, the first candidate that
    /// matches `descriptor` above the switch threshold gets locked.
    pub fn arm_reference(&mut self, descriptor: AppearanceDescriptor) {
        info!(mode = %descriptor.mode(), "reference armed");
        self.reference = Some(descriptor);
    }

    pub fn reference(&self) -> Option<&AppearanceDescriptor> {
        self.reference.as_ref()
    }

    /// Analyze and composite one frame.
    pub fn process_frame(&mut self, frame: &RgbFrame) -> FrameOutput {
        let analysis = self.analyze_frame(frame);
        self.render(analysis)
    }

    /// First half of [`process_frame`](Self::process_frame): detection and the
    /// lock cascade. The result is remembered for [`select_at`](Self::select_at).
    pub fn analyze_frame(&mut self, frame: &RgbFrame) -> Analysis {
        let analysis = self
            .analyzer
            .analyze(frame, &self.config, &mut self.lock, self.reference.as_ref());
        self.last = Some(analysis.clone());
        analysis
    }

    /// Second half of [`process_frame`](Self::process_frame): compositing and
    /// overlay.
    pub fn render(&mut self, analysis: Analysis) -> FrameOutput {
        let composited = self.renderer.render(&analysis, &self.config);
        FrameOutput {
            frame: composited,
            identity: analysis.identity,
            matcher_mode: self.matcher_mode(),
            analysis,
        }
    }

    /// The most recent analysis, including any selection made on it.
    pub fn last_analysis(&self) -> Option<&Analysis> {
        self.last.as_ref()
    }

    /// Lock onto whatever is under `(x, y)` in the most recently analyzed
    /// frame. On success that analysis is updated to focus the selected box.
    /// Failures leave the session untouched.
    pub fn select_at(&mut self, x: i32, y: i32) -> Result<Selection, SelectionError> {
        if self.config.lock_target {
            return Err(SelectionError::TargetLocked);
        }
        let Some(last) = self.last.as_mut() else {
            return Err(SelectionError::NoDetection { x, y });
        };
        let selection = resolve_click(&last.detections, x, y)?;
        let descriptor = if self.config.appearance_match {
            let descriptor = self.analyzer.matcher().describe(&last.frame, selection.bbox);
            if descriptor.is_none() {
                debug!(bbox = ?selection.bbox, "selected box has no usable descriptor");
            }
            descriptor
        } else {
            None
        };
        info!(track_id = %selection.track_id, "target selected");
        self.lock.engage(selection, descriptor);
        last.resolved = Some(Resolved {
            bbox: selection.bbox,
            via: Resolution::Selected,
            similarity: None,
        });
        last.identity = Some(selection.track_id);
        Ok(selection)
    }

    /// Drop the lock; configuration and any armed reference stay.
    pub fn reset(&mut self) {
        info!("session reset");
        self.lock.clear();
    }

    /// Drop the lock and the armed reference.
    pub fn stop(&mut self) {
        info!("session stopped");
        self.lock.clear();
        self.reference = None;
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appearance::tests::MeanColor;
    use crate::detection::{BoundingBox, RawDetections};
    use anyhow::Result;
    use image::{Rgb, RgbImage};

    /// Serves the same detections for every frame.
    struct Fixed(RawDetections);

    impl Detector for Fixed {
        fn detect(&mut self, _frame: &RgbFrame) -> Result<RawDetections> {
            Ok(self.0.clone())
        }
    }

    struct Failing;

    impl Detector for Failing {
        fn detect(&mut self, _frame: &RgbFrame) -> Result<RawDetections> {
            anyhow::bail!("detector offline")
        }
    }

    fn two_people() -> RawDetections {
        RawDetections {
            boxes: vec![[10.0, 10.0, 40.0, 50.0], [60.0, 10.0, 90.0, 50.0]],
            ids: Some(vec![Some(1), Some(2)]),
            confidences: Some(vec![Some(0.9), Some(0.8)]),
        }
    }

    fn frame() -> RgbFrame {
        let img = RgbImage::from_fn(100, 60, |x, y| {
            if (10..40).contains(&x) && (10..50).contains(&y) {
                Rgb([230, 20, 20])
            } else if (60..90).contains(&x) && (10..50).contains(&y) {
                Rgb([20, 20, 230])
            } else {
                Rgb([((x * 5) % 256) as u8, 90, ((y * 7) % 256) as u8])
            }
        });
        RgbFrame::from_image(img, 0)
    }

    fn session(config: SessionConfig) -> Session {
        Session::new(
            config,
            Box::new(Fixed(two_people())),
            AppearanceMatcher::new(Box::new(MeanColor)),
        )
    }

    #[test]
    fn unlocked_frames_pass_through() {
        let mut s = session(SessionConfig {
            show_boxes: false,
            ..SessionConfig::default()
        });
        let f = frame();
        let out = s.process_frame(&f);
        assert_eq!(out.frame, f);
        assert_eq!(out.identity, None);
        assert_eq!(out.matcher_mode, Some(MatcherMode::Learned));
    }

    #[test]
    fn click_locks_and_focus_follows() {
        let mut s = session(SessionConfig {
            show_boxes: false,
            ..SessionConfig::default()
        });
        let f = frame();
        s.process_frame(&f);
        let sel = s.select_at(20, 20).unwrap();
        assert_eq!(sel.track_id, TrackId(1));
        assert!(s.is_locked());
        assert!(s.lock().descriptor().is_some());

        let out = s.process_frame(&f);
        assert_eq!(out.identity, Some(TrackId(1)));
        let expected = apply_focus(&f, Some(BoundingBox::new(10, 10, 40, 50)), FocusMode::Hard);
        assert_eq!(out.frame, expected);
    }

    #[test]
    fn selection_frame_is_rendered_focused() {
        let mut s = session(SessionConfig {
            show_boxes: false,
            ..SessionConfig::default()
        });
        let f = frame();
        let analysis = s.analyze_frame(&f);
        assert!(analysis.resolved.is_none());

        s.select_at(70, 20).unwrap();
        let selected = s.last_analysis().cloned().unwrap();
        assert_eq!(selected.identity, Some(TrackId(2)));
        assert_eq!(selected.resolved.map(|r| r.via), Some(Resolution::Selected));

        let out = s.render(selected);
        let expected = apply_focus(&f, Some(BoundingBox::new(60, 10, 90, 50)), FocusMode::Hard);
        assert_eq!(out.frame, expected);
        assert_eq!(out.identity, Some(TrackId(2)));
    }

    #[test]
    fn selection_skips_descriptor_when_appearance_disabled() {
        let mut s = session(SessionConfig {
            appearance_match: false,
            ..SessionConfig::default()
        });
        s.process_frame(&frame());
        s.select_at(20, 20).unwrap();
        assert!(s.is_locked());
        assert!(s.lock().descriptor().is_none());
    }

    #[test]
    fn failed_clicks_change_nothing() {
        let mut s = session(SessionConfig::default());
        assert_eq!(s.select_at(20, 20), Err(SelectionError::NoDetection { x: 20, y: 20 }));
        s.process_frame(&frame());
        assert!(s.select_at(50, 5).is_err());
        assert!(!s.is_locked());

        s.select_at(20, 20).unwrap();
        let before = s.lock().clone();
        assert!(s.select_at(50, 5).is_err());
        assert_eq!(s.lock(), &before);
    }

    #[test]
    fn lock_flag_rejects_reselection() {
        let mut s = session(SessionConfig::default());
        s.process_frame(&frame());
        s.select_at(20, 20).unwrap();
        s.set_config(SessionConfig {
            lock_target: true,
            ..SessionConfig::default()
        });
        assert_eq!(s.select_at(70, 20), Err(SelectionError::TargetLocked));
        assert_eq!(s.lock().identity(), Some(TrackId(1)));
    }

    #[test]
    fn reference_arming_locks_best_match() {
        let mut s = session(SessionConfig::default());
        let blue = s
            .matcher()
            .describe_image(&RgbImage::from_pixel(8, 8, Rgb([20, 20, 230])))
            .unwrap();
        s.arm_reference(blue);
        let out = s.process_frame(&frame());
        assert_eq!(out.identity, Some(TrackId(2)));
        assert_eq!(out.analysis.resolved.map(|r| r.bbox), Some(BoundingBox::new(60, 10, 90, 50)));

        s.reset();
        assert!(!s.is_locked());
        assert!(s.reference().is_some());
        s.stop();
        assert!(s.reference().is_none());
    }

    #[test]
    fn detector_faults_degrade_to_empty_frames() {
        let mut s = Session::new(
            SessionConfig::default(),
            Box::new(Failing),
            AppearanceMatcher::new(Box::new(MeanColor)),
        );
        let out = s.process_frame(&frame());
        assert!(out.analysis.detections.is_empty());
        assert_eq!(out.frame, frame());
    }

    #[test]
    fn matcher_mode_hidden_when_appearance_disabled() {
        let s = session(SessionConfig {
            appearance_match: false,
            ..SessionConfig::default()
        });
        assert_eq!(s.matcher_mode(), None);
    }
}
