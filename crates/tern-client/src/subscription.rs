//! Client-side subscriptions.
//!
//! A subscription binds to the images of every producer session matched on
//! its channel and stream. Polling round-robins across images so one fast
//! session cannot starve the others.

use std::cell::RefCell;
use std::rc::Rc;

use crate::image::{FragmentHandler, Image};

pub(crate) struct SubscriptionState {
    pub registration_id: i64,
    pub channel: String,
    pub stream_id: i32,
    pub channel_status_indicator_id: i32,
    pub images: Vec<Image>,
    pub round_robin_index: usize,
    pub is_closed: bool,
}

/// Consumer handle onto a (channel, streamId).
pub struct Subscription {
    pub(crate) state: Rc<RefCell<SubscriptionState>>,
}

impl Subscription {
    pub fn registration_id(&self) -> i64 {
        self.state.borrow().registration_id
    }

    pub fn channel(&self) -> String {
        self.state.borrow().channel.clone()
    }

    pub fn stream_id(&self) -> i32 {
        self.state.borrow().stream_id
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().is_closed
    }

    /// Number of producer sessions currently visible.
    pub fn image_count(&self) -> usize {
        self.state.borrow().images.len()
    }

    pub fn is_connected(&self) -> bool {
        self.image_count() > 0
    }

    /// Poll each image in turn for up to `fragment_limit` fragments total.
    pub fn poll(&self, handler: FragmentHandler<'_>, fragment_limit: usize) -> usize {
        let mut state = self.state.borrow_mut();
        if state.is_closed || state.images.is_empty() {
            return 0;
        }

        let image_count = state.images.len();
        let starting_index = state.round_robin_index % image_count;
        state.round_robin_index = state.round_robin_index.wrapping_add(1);

        let mut fragments_read = 0;
        for i in 0..image_count {
            if fragments_read >= fragment_limit {
                break;
            }
            let index = (starting_index + i) % image_count;
            fragments_read += state.images[index].poll(&mut *handler, fragment_limit - fragments_read);
        }

        fragments_read
    }

    /// Run `func` over each image, e.g. to inspect positions.
    pub fn for_each_image(&self, mut func: impl FnMut(&Image)) {
        for image in &self.state.borrow().images {
            func(image);
        }
    }

    /// The position of the slowest image, or 0 when none are attached.
    pub fn min_position(&self) -> i64 {
        self.state
            .borrow()
            .images
            .iter()
            .map(|image| image.position())
            .min()
            .unwrap_or(0)
    }
}
