//! Keyframe selection for image measurements
//!
//! An image anchors a new window node when it carries enough tracks and has moved far enough
//! (mean pixel parallax over tracks shared with the last keyframe). The front end's keyframe
//! hint can promote an image that misses the parallax threshold, but not one with fewer than
//! half the required tracks.

use std::collections::BTreeMap;

use crate::measurement::ImageFrame;
use crate::types::Vector2;
use crate::window::NodeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyframeDecision {
    AttachToCurrent,
    NewNode,
}

#[derive(Clone, Debug)]
pub struct KeyframeSelector {
    min_feature_count: usize,
    min_parallax: f64,
    /// Track id -> pixel in the last keyframe
    last_keyframe: Option<BTreeMap<u64, Vector2>>,
}

impl KeyframeSelector {
    pub fn new(min_feature_count: usize, min_parallax: f64) -> Self {
        Self {
            min_feature_count,
            min_parallax,
            last_keyframe: None,
        }
    }

    pub fn evaluate(&self, image: &ImageFrame, current_node: Option<NodeId>) -> KeyframeDecision {
        if current_node.is_none() || self.last_keyframe.is_none() {
            return KeyframeDecision::NewNode;
        }

        let count = image.features.len();
        // Nothing shared with the last keyframe means an entirely new view
        let parallax = self.parallax(image).unwrap_or(f64::INFINITY);

        let thresholds_met = count >= self.min_feature_count && parallax >= self.min_parallax;
        let badly_violated = 2 * count < self.min_feature_count;

        if thresholds_met || (image.new_keyframe_hint && !badly_violated) {
            KeyframeDecision::NewNode
        } else {
            KeyframeDecision::AttachToCurrent
        }
    }

    /// Mean pixel displacement of tracks shared with the last keyframe
    pub fn parallax(&self, image: &ImageFrame) -> Option<f64> {
        let last = self.last_keyframe.as_ref()?;
        let (sum, shared) = image
            .features
            .iter()
            .filter_map(|f| last.get(&f.id).map(|prev| (f.pixel - prev).norm()))
            .fold((0.0, 0usize), |(sum, n), d| (sum + d, n + 1));
        if shared == 0 {
            None
        } else {
            Some(sum / shared as f64)
        }
    }

    /// Fold a non-keyframe image into the current keyframe's view. Tracks first seen here are
    /// measured against this sighting from now on; returns how many were adopted.
    pub fn absorb(&mut self, image: &ImageFrame) -> usize {
        let Some(last) = self.last_keyframe.as_mut() else {
            return 0;
        };
        let mut adopted = 0;
        for f in &image.features {
            if let std::collections::btree_map::Entry::Vacant(e) = last.entry(f.id) {
                e.insert(f.pixel);
                adopted += 1;
            }
        }
        adopted
    }

    /// Remember `image` as the latest keyframe
    pub fn commit(&mut self, image: &ImageFrame) {
        self.last_keyframe = Some(image.features.iter().map(|f| (f.id, f.pixel)).collect());
    }
}
