//! External collaborator boundary for the DOM/video-surface, explicitly out
//! of scope per spec.md §1 ("Explicitly out of scope... the DOM/video-surface
//! itself"). This trait is the full extent of that contract; nothing about
//! an actual browser DOM is modeled here.

/// An opaque handle to a rendering surface (a container `<div>` or a
/// `<video>` element, in the browser). Equality is identity, matching how a
/// DOM node reference behaves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub String);

impl SurfaceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Outcome of appending one media segment to a surface's source buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Ok,
    /// The browser's `SourceBuffer.appendBuffer` threw `QuotaExceededError`.
    QuotaExceeded,
    Failed(String),
}

/// Decoded codec and dimensions, known once the surface has parsed enough of
/// the stream to report them (spec.md §4.5 `VIDEO_INFO_RECEIVED`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoInfo {
    pub codec: String,
    pub width: u32,
    pub height: u32,
}

/// Either a pre-existing element resolved by id/handle, or a session-owned
/// element created fresh inside a container.
pub trait DomCollaborator: Send + Sync {
    fn resolve_by_id(&self, id: &str) -> Option<SurfaceHandle>;

    /// Creates a new `<video>` surface as a child of `container`, owned by
    /// the caller (removed on teardown unless retained).
    fn create_child_video_surface(&self, container: &SurfaceHandle) -> SurfaceHandle;

    fn apply_class(&self, handle: &SurfaceHandle, class: &str);
    fn remove_class(&self, handle: &SurfaceHandle, class: &str);

    fn set_muted_and_playsinline(&self, handle: &SurfaceHandle);

    /// Sets the surface's media source to the empty sentinel. Must be
    /// called *before* [`DomCollaborator::detach`] — see spec.md §9 "Surface
    /// lifecycle ambiguity"; reversing the order leaks buffer references.
    fn clear_source(&self, handle: &SurfaceHandle);

    /// Removes a session-owned surface from the document tree.
    fn detach(&self, handle: &SurfaceHandle);

    fn is_document_hidden(&self) -> bool;
    fn is_online(&self) -> bool;

    fn request_fullscreen(&self, container: &SurfaceHandle);
    fn exit_fullscreen(&self);

    /// Appends one media segment to the surface's source buffer. Mirrors the
    /// synchronous-throw shape of the browser's MSE API (spec.md §4.5).
    fn append_segment(&self, handle: &SurfaceHandle, data: &[u8]) -> AppendOutcome;

    /// Evicts the oldest buffered range at or above `threshold` from the
    /// surface's source buffer, in response to `AppendOutcome::QuotaExceeded`.
    fn evict_oldest_buffered_range(&self, handle: &SurfaceHandle, threshold: std::time::Duration);

    /// Polled after a successful append; `true` the first time (and every
    /// time thereafter) the surface reports a frame has actually been
    /// rendered to the screen.
    fn has_rendered_frame(&self, handle: &SurfaceHandle) -> bool;

    /// Polled after a successful append, alongside [`Self::has_rendered_frame`];
    /// `Some` once the surface can report the decoded codec/dimensions.
    fn video_info(&self, handle: &SurfaceHandle) -> Option<VideoInfo>;
}

pub const CONTAINER_CLASS: &str = "clsp-player-container";
pub const VIDEO_CLASS: &str = "clsp-player";

/// The union of ways a caller may hand the session its surfaces
/// (spec.md §4.7 `initializeElements`).
#[derive(Debug, Clone, Default)]
pub struct SurfaceConfig {
    pub container_element_id: Option<String>,
    pub container_element: Option<SurfaceHandle>,
    pub video_element_id: Option<String>,
    pub video_element: Option<SurfaceHandle>,
}

#[derive(Debug, Clone)]
pub struct ResolvedSurfaces {
    pub container: Option<SurfaceHandle>,
    pub video: SurfaceHandle,
    pub should_retain_surface: bool,
}
