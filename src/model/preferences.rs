use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
  Light,
  Dark,
  #[default]
  System,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultView {
  #[default]
  Grid,
  List,
}

/// User preferences persisted in the local store.
///
/// Every field has a default so an older stored value missing newer fields
/// still deserializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserPreferences {
  pub theme: Theme,
  pub language: String,
  pub sidebar_collapsed: bool,
  pub default_view: DefaultView,
  /// Drain the offline queue automatically when connectivity returns
  pub auto_sync: bool,
  /// Treat the remote as unreachable regardless of connectivity
  pub offline_mode: bool,
}

impl Default for UserPreferences {
  fn default() -> Self {
    Self {
      theme: Theme::System,
      language: "en".to_string(),
      sidebar_collapsed: false,
      default_view: DefaultView::Grid,
      auto_sync: true,
      offline_mode: false,
    }
  }
}

/// Partial update applied by [`UserPreferences::apply`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PreferencesPatch {
  pub theme: Option<Theme>,
  pub language: Option<String>,
  pub sidebar_collapsed: Option<bool>,
  pub default_view: Option<DefaultView>,
  pub auto_sync: Option<bool>,
  pub offline_mode: Option<bool>,
}

impl UserPreferences {
  pub fn apply(&mut self, patch: PreferencesPatch) {
    if let Some(theme) = patch.theme {
      self.theme = theme;
    }
    if let Some(language) = patch.language {
      self.language = language;
    }
    if let Some(collapsed) = patch.sidebar_collapsed {
      self.sidebar_collapsed = collapsed;
    }
    if let Some(view) = patch.default_view {
      self.default_view = view;
    }
    if let Some(auto_sync) = patch.auto_sync {
      self.auto_sync = auto_sync;
    }
    if let Some(offline_mode) = patch.offline_mode {
      self.offline_mode = offline_mode;
    }
  }
}
