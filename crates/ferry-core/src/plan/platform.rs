//! Supported platform identifiers.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MigrationError;

/// A content platform a migration can read from or write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// WordPress.
    WordPress,
    /// Drupal.
    Drupal,
    /// Joomla.
    Joomla,
    /// Ghost.
    Ghost,
    /// Hugo static site generator.
    Hugo,
    /// Jekyll static site generator.
    Jekyll,
    /// Magento.
    Magento,
    /// Shopify.
    Shopify,
    /// WooCommerce.
    WooCommerce,
    /// Plain static HTML.
    Static,
}

impl Platform {
    /// All supported platforms.
    pub const ALL: [Platform; 10] = [
        Platform::WordPress,
        Platform::Drupal,
        Platform::Joomla,
        Platform::Ghost,
        Platform::Hugo,
        Platform::Jekyll,
        Platform::Magento,
        Platform::Shopify,
        Platform::WooCommerce,
        Platform::Static,
    ];

    /// Canonical identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::WordPress => "wordpress",
            Platform::Drupal => "drupal",
            Platform::Joomla => "joomla",
            Platform::Ghost => "ghost",
            Platform::Hugo => "hugo",
            Platform::Jekyll => "jekyll",
            Platform::Magento => "magento",
            Platform::Shopify => "shopify",
            Platform::WooCommerce => "woocommerce",
            Platform::Static => "static",
        }
    }

    /// Human readable name.
    pub fn display_name(&self) -> &'static str {
        match self {
            Platform::WordPress => "WordPress",
            Platform::Drupal => "Drupal",
            Platform::Joomla => "Joomla",
            Platform::Ghost => "Ghost",
            Platform::Hugo => "Hugo",
            Platform::Jekyll => "Jekyll",
            Platform::Magento => "Magento",
            Platform::Shopify => "Shopify",
            Platform::WooCommerce => "WooCommerce",
            Platform::Static => "Static HTML",
        }
    }

    /// Static site generators have no database to export.
    pub fn is_static_site(&self) -> bool {
        matches!(self, Platform::Hugo | Platform::Jekyll | Platform::Static)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let platform = match s.trim().to_ascii_lowercase().as_str() {
            "wordpress" | "wp" => Platform::WordPress,
            "drupal" => Platform::Drupal,
            "joomla" => Platform::Joomla,
            "ghost" => Platform::Ghost,
            "hugo" => Platform::Hugo,
            "jekyll" => Platform::Jekyll,
            "magento" => Platform::Magento,
            "shopify" => Platform::Shopify,
            "woocommerce" | "woo" => Platform::WooCommerce,
            "static" | "html" => Platform::Static,
            _ => {
                return Err(MigrationError::Configuration(format!(
                    "unknown platform '{}'",
                    s
                )))
            }
        };
        Ok(platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_platform() {
        assert_eq!("wordpress".parse::<Platform>().unwrap(), Platform::WordPress);
        assert_eq!("WP".parse::<Platform>().unwrap(), Platform::WordPress);
        assert_eq!(" Ghost ".parse::<Platform>().unwrap(), Platform::Ghost);
        assert_eq!("woo".parse::<Platform>().unwrap(), Platform::WooCommerce);
    }

    #[test]
    fn test_unknown_platform() {
        let err = "frontpage".parse::<Platform>().unwrap_err();
        assert!(matches!(err, MigrationError::Configuration(_)));
        assert!(err.to_string().contains("frontpage"));
    }

    #[test]
    fn test_round_trip_identifiers() {
        for platform in Platform::ALL {
            assert_eq!(platform.as_str().parse::<Platform>().unwrap(), platform);
        }
    }

    #[test]
    fn test_serde_identifier() {
        let json = serde_json::to_string(&Platform::WooCommerce).unwrap();
        assert_eq!(json, "\"woocommerce\"");
    }
}
