//! Generated-name rendering.
//!
//! Rendered names carry the `crowdsec-*` namespace and are the sole
//! authoritative identity of managed controller objects: anything whose
//! name was not produced by these templates is never touched.

use ub_common::Family;

/// Inputs available to the name templates.
#[derive(Debug, Clone, Copy)]
pub struct NameParts<'a> {
    pub family: Family,
    pub index: usize,
    pub site: &'a str,
    pub src_zone: Option<&'a str>,
    pub dst_zone: Option<&'a str>,
}

impl<'a> NameParts<'a> {
    pub fn new(family: Family, index: usize, site: &'a str) -> Self {
        Self {
            family,
            index,
            site,
            src_zone: None,
            dst_zone: None,
        }
    }

    pub fn with_zones(mut self, src: &'a str, dst: &'a str) -> Self {
        self.src_zone = Some(src);
        self.dst_zone = Some(dst);
        self
    }
}

/// Render a template over `{family}`, `{index}`, `{site}`, `{src}`, `{dst}`.
pub fn render(template: &str, parts: NameParts<'_>) -> String {
    template
        .replace("{family}", parts.family.as_str())
        .replace("{index}", &parts.index.to_string())
        .replace("{site}", parts.site)
        .replace("{src}", parts.src_zone.unwrap_or(""))
        .replace("{dst}", parts.dst_zone.unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_group_template() {
        let name = render(
            "crowdsec-{family}-{index}",
            NameParts::new(Family::V4, 2, "default"),
        );
        assert_eq!(name, "crowdsec-v4-2");
    }

    #[test]
    fn renders_zone_template() {
        let name = render(
            "crowdsec-{src}-{dst}-{family}-{index}",
            NameParts::new(Family::V6, 0, "default").with_zones("External", "Internal"),
        );
        assert_eq!(name, "crowdsec-External-Internal-v6-0");
    }

    #[test]
    fn site_placeholder() {
        let name = render(
            "crowdsec-{site}-{family}-{index}",
            NameParts::new(Family::V4, 0, "branch"),
        );
        assert_eq!(name, "crowdsec-branch-v4-0");
    }
}
