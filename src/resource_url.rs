use std::fmt;
use std::sync::Arc;

/// Identifies a resource by its URL. Identity is exact string match, no
/// normalization is applied to the caller-supplied value. Cheap to clone.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceUrl(Arc<str>);

impl ResourceUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> ResourceKind {
        ResourceKind::classify(&self.0)
    }
}

impl From<&str> for ResourceUrl {
    fn from(url: &str) -> Self {
        ResourceUrl(Arc::from(url))
    }
}

impl From<String> for ResourceUrl {
    fn from(url: String) -> Self {
        ResourceUrl(Arc::from(url.as_str()))
    }
}

impl fmt::Display for ResourceUrl {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ResourceUrl {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "ResourceUrl({})", self.0)
    }
}

/// How a resource should be injected into the host environment. Produced by
/// [`ResourceKind::classify`] and handed to the [`ResourceInjector`] so that
/// the injection strategy is chosen by data rather than by the injector
/// re-parsing the URL.
///
/// [`ResourceInjector`]: crate::loader::ResourceInjector
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Script,
    Stylesheet,
}

impl ResourceKind {
    /// Classifies a URL by the substring after its last `.`. A trailing
    /// extension of `css` (ASCII case-insensitive) is a stylesheet; anything
    /// else, including a missing extension, is a script.
    pub fn classify(url: &str) -> ResourceKind {
        let extension = url.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
        if extension.eq_ignore_ascii_case("css") {
            ResourceKind::Stylesheet
        } else {
            ResourceKind::Script
        }
    }
}
