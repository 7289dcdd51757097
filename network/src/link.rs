// PHY link edge detection

/// Transition of the physical link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEdge {
    Up,
    Down,
}

/// Remembers the last sampled link state and reports changes
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkMonitor {
    phy_link: bool,
}

impl LinkMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last observed link state
    pub fn is_up(&self) -> bool {
        self.phy_link
    }

    /// Feed one sample of the link register
    ///
    /// # Returns
    /// * `Some(edge)` - The link changed since the previous sample
    /// * `None` - No change
    pub fn sample(&mut self, link: bool) -> Option<LinkEdge> {
        if link == self.phy_link {
            return None;
        }
        self.phy_link = link;
        let edge = if link { LinkEdge::Up } else { LinkEdge::Down };
        log::trace!("link {:?}", edge);
        Some(edge)
    }
}
