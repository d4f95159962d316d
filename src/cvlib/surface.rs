use crate::types::Resource;

/// Display element that shows at most one resource. Binding `None` clears it.
pub trait Surface {
    fn bind(&mut self, resource: Option<Resource>);
}

/// Closures can be used as surfaces, e.g., to forward the resource to a gui texture.
impl<F> Surface for F
where
    F: FnMut(Option<Resource>),
{
    fn bind(&mut self, resource: Option<Resource>) {
        (*self)(resource)
    }
}

/// Headless surface that keeps the bound resource.
#[derive(Debug, Default, Clone)]
pub struct ImageSurface {
    resource: Option<Resource>,
    n_binds: usize,
}

impl ImageSurface {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn resource(&self) -> Option<&Resource> {
        self.resource.as_ref()
    }
    pub fn is_bound(&self) -> bool {
        self.resource.is_some()
    }
    /// How often [`Surface::bind`](Surface::bind) was called, clears included.
    pub fn n_binds(&self) -> usize {
        self.n_binds
    }
}

impl Surface for ImageSurface {
    fn bind(&mut self, resource: Option<Resource>) {
        self.n_binds += 1;
        self.resource = resource;
    }
}

#[cfg(test)]
use crate::{result::CvResult, test_helpers::rgb_resource};

#[test]
fn test_image_surface() -> CvResult<()> {
    let mut surface = ImageSurface::new();
    assert!(!surface.is_bound());
    surface.bind(Some(rgb_resource("https://x/a.png", 2, 2)?));
    assert_eq!(
        surface.resource().map(|r| r.key().as_str()),
        Some("https://x/a.png")
    );
    surface.bind(None);
    assert!(!surface.is_bound());
    assert_eq!(surface.n_binds(), 2);
    Ok(())
}

#[test]
fn test_closure_surface() -> CvResult<()> {
    let mut bound = vec![];
    {
        let mut surface = |r: Option<Resource>| bound.push(r.map(|r| r.dimensions()));
        surface.bind(Some(rgb_resource("https://x/a.png", 2, 3)?));
        surface.bind(None);
    }
    assert_eq!(bound, vec![Some((2, 3)), None]);
    Ok(())
}
