//! Visibility of the volumetric hull and lifetime of the textures portals are rendered into.

/// Visibility state of a portal's volumetric hull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HullState {
    Enabled,
    /// The off condition held for this many consecutive frames.
    PendingDisable(u32),
    #[default]
    Disabled,
}

/// Visible change of a hull, reported so the renderer can show or hide the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HullChange {
    Enabled,
    Disabled,
}

/// Debounced hull visibility. Turning on is immediate, turning off waits for a number of
/// consecutive off frames so one frame occupancy gaps don't make the hull pop.
#[derive(Debug, Clone, Default)]
pub struct VolumetricHull {
    state: HullState,
}

impl VolumetricHull {
    pub fn state(&self) -> HullState {
        self.state
    }

    pub fn is_visible(&self) -> bool {
        self.state != HullState::Disabled
    }

    /// Advance by one frame.
    pub fn update(&mut self, on_condition: bool, disable_after_frames: u32) -> Option<HullChange> {
        if on_condition {
            self.enable()
        } else {
            self.disable(disable_after_frames)
        }
    }

    pub fn enable(&mut self) -> Option<HullChange> {
        match self.state {
            HullState::Enabled => None,
            HullState::PendingDisable(_) => {
                self.state = HullState::Enabled;
                None
            }
            HullState::Disabled => {
                self.state = HullState::Enabled;
                Some(HullChange::Enabled)
            }
        }
    }

    pub fn disable(&mut self, disable_after_frames: u32) -> Option<HullChange> {
        let off_frames = match self.state {
            HullState::Disabled => return None,
            HullState::Enabled => 1,
            HullState::PendingDisable(n) => n + 1,
        };
        if off_frames >= disable_after_frames.max(1) {
            self.state = HullState::Disabled;
            Some(HullChange::Disabled)
        } else {
            self.state = HullState::PendingDisable(off_frames);
            None
        }
    }
}

/// Color and depth targets a portal camera renders into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTexturePair<H> {
    pub color: H,
    /// Depth of the portal view, kept for compositing the view with the scene in front of the
    /// portal. Cameras render their own depth buffer, nothing binds this one yet.
    pub depth: H,
    pub width: u32,
    pub height: u32,
}

/// Renderer side allocation of portal textures.
pub trait RenderTextureAllocator {
    type Handle;

    fn allocate(&mut self, width: u32, height: u32) -> RenderTexturePair<Self::Handle>;
    fn release(&mut self, pair: RenderTexturePair<Self::Handle>);
}

/// The single texture pair owned by a portal. The previous pair is always released before a new
/// one is allocated.
#[derive(Debug)]
pub struct RenderTargets<H> {
    pair: Option<RenderTexturePair<H>>,
}

impl<H> Default for RenderTargets<H> {
    fn default() -> Self {
        RenderTargets { pair: None }
    }
}

impl<H> RenderTargets<H> {
    pub fn current(&self) -> Option<&RenderTexturePair<H>> {
        self.pair.as_ref()
    }

    pub fn create<A>(&mut self, allocator: &mut A, width: u32, height: u32) -> &RenderTexturePair<H>
    where
        A: RenderTextureAllocator<Handle = H>,
    {
        self.release(allocator);
        self.pair
            .insert(allocator.allocate(width.max(1), height.max(1)))
    }

    /// Recreate the pair for a new screen resolution. Does nothing if no pair exists or the size
    /// didn't change, returns whether a new pair was allocated.
    pub fn resize<A>(&mut self, allocator: &mut A, width: u32, height: u32) -> bool
    where
        A: RenderTextureAllocator<Handle = H>,
    {
        let stale = self
            .pair
            .as_ref()
            .map_or(false, |pair| pair.width != width.max(1) || pair.height != height.max(1));
        if stale {
            self.create(allocator, width, height);
        }
        stale
    }

    pub fn release<A>(&mut self, allocator: &mut A)
    where
        A: RenderTextureAllocator<Handle = H>,
    {
        if let Some(pair) = self.pair.take() {
            allocator.release(pair);
        }
    }
}
