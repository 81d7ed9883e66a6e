//! Menu model populated by RPC consumers.
//!
//! Menus form a tree addressed by paths of submenu ids, for example `["main", "File", "0_open"]`.
//! Submenus are created on demand as paths are registered.  A submenu can additionally be linked
//! into another submenu, so the same node appears in several places; links that would make a
//! submenu its own descendant are refused and leave the tree untouched.
use std::sync::{Arc, RwLock};

use itertools::Itertools;

use crate::MenuError;
use crate::sync::RwLockExt;

pub type MenuPath<'a> = &'a [&'a str];

/// A command placed in a menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuAction {
    pub command_id: String,
    pub label: Option<String>,
    pub order: Option<String>,
}

impl MenuAction {
    pub fn new(command_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            label: None,
            order: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }
}

#[derive(Debug, Clone)]
pub enum MenuNode {
    Submenu(Arc<CompositeMenuNode>),
    Action(Arc<MenuAction>),
}

impl MenuNode {
    pub fn id(&self) -> &str {
        match self {
            MenuNode::Submenu(submenu) => submenu.id(),
            MenuNode::Action(action) => &action.command_id,
        }
    }

    fn sort_key(&self) -> String {
        match self {
            MenuNode::Submenu(submenu) => submenu.order().unwrap_or_else(|| submenu.id.clone()),
            MenuNode::Action(action) => action.order.clone().unwrap_or_else(|| action.command_id.clone()),
        }
    }

    pub fn as_submenu(&self) -> Option<&Arc<CompositeMenuNode>> {
        match self {
            MenuNode::Submenu(submenu) => Some(submenu),
            MenuNode::Action(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct CompositeMenuNode {
    id: String,
    label: RwLock<Option<String>>,
    order: RwLock<Option<String>>,
    children: RwLock<Vec<MenuNode>>,
}

impl CompositeMenuNode {
    fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            label: RwLock::new(None),
            order: RwLock::new(None),
            children: RwLock::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> Option<String> {
        self.label.read_unpoisoned().clone()
    }

    pub fn order(&self) -> Option<String> {
        self.order.read_unpoisoned().clone()
    }

    /// Position this submenu among its siblings by `order` instead of by its id.
    pub fn set_order(&self, order: impl Into<String>) {
        *self.order.write_unpoisoned() = Some(order.into());
    }

    /// Children ordered by their order key (falling back to the id), ties broken by id.
    pub fn children(&self) -> Vec<MenuNode> {
        self.children
            .read_unpoisoned()
            .iter()
            .cloned()
            .sorted_by_cached_key(|child| (child.sort_key(), child.id().to_string()))
            .collect()
    }

    pub fn submenu(&self, id: &str) -> Option<Arc<CompositeMenuNode>> {
        self.children
            .read_unpoisoned()
            .iter()
            .filter_map(MenuNode::as_submenu)
            .find(|submenu| submenu.id == id)
            .cloned()
    }

    fn child_or_create(&self, id: &str) -> Result<Arc<CompositeMenuNode>, MenuError> {
        let mut children = self.children.write_unpoisoned();
        match children.iter().find(|child| child.id() == id) {
            Some(MenuNode::Submenu(submenu)) => Ok(submenu.clone()),
            Some(MenuNode::Action(_)) => Err(MenuError::NotASubmenu { id: id.to_string() }),
            None => {
                let submenu = CompositeMenuNode::new(id);
                children.push(MenuNode::Submenu(submenu.clone()));
                Ok(submenu)
            }
        }
    }

    fn contains(&self, node: &Arc<CompositeMenuNode>) -> bool {
        self.children()
            .iter()
            .filter_map(MenuNode::as_submenu)
            .any(|child| Arc::ptr_eq(child, node) || child.contains(node))
    }

    /// Deterministic rendering of the submenu structure: `id(child,child)`, actions omitted.
    pub fn structure(&self) -> String {
        let children = self
            .children()
            .iter()
            .filter_map(MenuNode::as_submenu)
            .map(|child| child.structure())
            .join(",");
        format!("{}({children})", self.id)
    }
}

/// Registry owning the root of the menu tree.
#[derive(Debug)]
pub struct MenuModelRegistry {
    root: Arc<CompositeMenuNode>,
}

impl Default for MenuModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MenuModelRegistry {
    pub fn new() -> Self {
        Self {
            root: CompositeMenuNode::new(""),
        }
    }

    pub fn root(&self) -> &Arc<CompositeMenuNode> {
        &self.root
    }

    /// Return the submenu at `path`, creating any missing submenus along the way.  The empty
    /// path is the root.
    pub fn get_menu(&self, path: MenuPath<'_>) -> Result<Arc<CompositeMenuNode>, MenuError> {
        path.iter()
            .try_fold(self.root.clone(), |parent, id| parent.child_or_create(id))
    }

    /// Look up an existing submenu without creating anything.
    pub fn find_menu(&self, path: MenuPath<'_>) -> Option<Arc<CompositeMenuNode>> {
        path.iter()
            .try_fold(self.root.clone(), |parent, id| parent.submenu(id))
    }

    /// The deepest existing submenu along `path`, and whether that is the whole path.
    fn deepest_existing(&self, path: MenuPath<'_>) -> (Arc<CompositeMenuNode>, bool) {
        let mut node = self.root.clone();
        for id in path {
            match node.submenu(id) {
                Some(next) => node = next,
                None => return (node, false),
            }
        }
        (node, true)
    }

    pub fn register_submenu(
        &self,
        path: MenuPath<'_>,
        label: impl Into<String>,
    ) -> Result<Arc<CompositeMenuNode>, MenuError> {
        if path.is_empty() {
            return Err(MenuError::EmptyPath);
        }

        let submenu = self.get_menu(path)?;
        *submenu.label.write_unpoisoned() = Some(label.into());
        Ok(submenu)
    }

    pub fn register_menu_action(&self, path: MenuPath<'_>, action: MenuAction) -> Result<(), MenuError> {
        let parent = self.get_menu(path)?;
        tracing::trace!(command = %action.command_id, path = %path.join("/"), "Registering menu action");
        parent.children.write_unpoisoned().push(MenuNode::Action(Arc::new(action)));
        Ok(())
    }

    /// Make the existing submenu at `child` also appear as a child of the submenu at `parent`.
    pub fn link_submenu(&self, parent: MenuPath<'_>, child: MenuPath<'_>) -> Result<(), MenuError> {
        if child.is_empty() {
            return Err(MenuError::EmptyPath);
        }

        let child_node = self.find_menu(child).ok_or_else(|| MenuError::SubmenuNotFound {
            path: child.join("/"),
        })?;

        // Check before creating anything so a refused link leaves the tree as it was.  Whatever
        // part of `parent` already exists ends up an ancestor of the parent, so the link is a
        // cycle if that part runs through `child`.
        let (deepest, complete) = self.deepest_existing(parent);
        if complete && Arc::ptr_eq(&deepest, &child_node) {
            return Err(MenuError::LinkToSelf {
                id: child_node.id.clone(),
            });
        }
        if Arc::ptr_eq(&deepest, &child_node) || child_node.contains(&deepest) {
            return Err(MenuError::Cycle {
                parent: parent.last().map_or_else(String::new, |id| id.to_string()),
                child: child_node.id.clone(),
            });
        }

        let parent_node = self.get_menu(parent)?;
        parent_node.children.write_unpoisoned().push(MenuNode::Submenu(child_node));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const FILE: &[&str] = &["main", "File"];
    const FILE_OPEN: &[&str] = &["main", "File", "0_open"];
    const FILE_CLOSE: &[&str] = &["main", "File", "1_close"];

    #[test]
    fn nested_registration_builds_tree() {
        let registry = MenuModelRegistry::new();
        registry.register_submenu(FILE, "File").unwrap();
        registry.register_submenu(FILE_OPEN, "Open").unwrap();
        registry
            .register_menu_action(FILE_OPEN, MenuAction::new("open_file"))
            .unwrap();
        registry
            .register_menu_action(FILE_OPEN, MenuAction::new("open_folder"))
            .unwrap();

        let main = registry.get_menu(&["main"]).unwrap();
        assert_eq!(main.children().len(), 1);

        let file = main.children()[0].as_submenu().unwrap().clone();
        assert_eq!(file.label().as_deref(), Some("File"));
        let open = file.children()[0].as_submenu().unwrap().clone();
        assert_eq!(open.children().len(), 2);
    }

    #[test]
    fn linking_submenus() {
        let registry = MenuModelRegistry::new();
        registry.register_menu_action(FILE_OPEN, MenuAction::new("open")).unwrap();
        registry.register_menu_action(FILE_CLOSE, MenuAction::new("close")).unwrap();

        assert_matches!(
            registry.link_submenu(FILE_OPEN, FILE_OPEN),
            Err(MenuError::LinkToSelf { id }) if id == "0_open"
        );
        assert_eq!(registry.find_menu(FILE).unwrap().structure(), "File(0_open(),1_close())");

        registry.link_submenu(FILE_OPEN, FILE_CLOSE).unwrap();

        let file = registry.find_menu(FILE).unwrap();
        assert_eq!(file.structure(), "File(0_open(1_close()),1_close())");
    }

    #[test]
    fn linking_an_ancestor_is_refused() {
        let registry = MenuModelRegistry::new();
        registry.register_submenu(FILE_OPEN, "Open").unwrap();

        assert_matches!(
            registry.link_submenu(FILE_OPEN, FILE),
            Err(MenuError::Cycle { parent, child }) if parent == "0_open" && child == "File"
        );
        assert_eq!(registry.find_menu(FILE).unwrap().structure(), "File(0_open())");
    }

    #[test]
    fn linking_below_a_missing_descendant_is_refused() {
        let registry = MenuModelRegistry::new();
        registry.register_submenu(FILE, "File").unwrap();

        assert_matches!(
            registry.link_submenu(&["main", "File", "new"], FILE),
            Err(MenuError::Cycle { parent, child }) if parent == "new" && child == "File"
        );
        assert!(registry.find_menu(&["main", "File", "new"]).is_none());
        assert_eq!(registry.find_menu(FILE).unwrap().structure(), "File()");

        // Also when the missing part is deeper and the existing part only reaches the child
        // through a link
        registry.register_submenu(&["main", "Edit"], "Edit").unwrap();
        registry.link_submenu(&["main", "Edit"], FILE).unwrap();
        assert_matches!(
            registry.link_submenu(&["main", "File", "recent", "more"], &["main", "Edit"]),
            Err(MenuError::Cycle { .. })
        );
        assert_eq!(
            registry.find_menu(&["main"]).unwrap().structure(),
            "main(Edit(File()),File())"
        );
    }

    #[test]
    fn linking_unknown_submenu_fails() {
        let registry = MenuModelRegistry::new();
        assert_matches!(
            registry.link_submenu(FILE, &["main", "Edit"]),
            Err(MenuError::SubmenuNotFound { path }) if path == "main/Edit"
        );
        assert!(registry.find_menu(FILE).is_none());
    }

    #[test]
    fn actions_are_not_submenus() {
        let registry = MenuModelRegistry::new();
        registry.register_menu_action(FILE, MenuAction::new("save")).unwrap();

        assert_matches!(
            registry.get_menu(&["main", "File", "save"]),
            Err(MenuError::NotASubmenu { id }) if id == "save"
        );
    }

    #[test]
    fn children_sorted_by_order_then_id() {
        let registry = MenuModelRegistry::new();
        registry
            .register_menu_action(FILE, MenuAction::new("zeta").with_order("a"))
            .unwrap();
        registry.register_menu_action(FILE, MenuAction::new("beta")).unwrap();
        registry.register_menu_action(FILE, MenuAction::new("alpha")).unwrap();

        let ids = registry
            .find_menu(FILE)
            .unwrap()
            .children()
            .iter()
            .map(|child| child.id().to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, ["zeta", "alpha", "beta"]);
    }

    #[test]
    fn submenu_order_overrides_id() {
        let registry = MenuModelRegistry::new();
        registry.register_submenu(&["main", "File"], "File").unwrap();
        registry.register_submenu(&["main", "Edit"], "Edit").unwrap();
        registry.register_submenu(&["main", "Help"], "Help").unwrap().set_order("z");
        registry.get_menu(FILE).unwrap().set_order("1");
        registry.get_menu(&["main", "Edit"]).unwrap().set_order("2");

        assert_eq!(registry.find_menu(&["main"]).unwrap().structure(), "main(File(),Edit(),Help())");
        assert_eq!(registry.find_menu(FILE).unwrap().order().as_deref(), Some("1"));
    }

    #[test]
    fn empty_submenu_path_is_rejected() {
        let registry = MenuModelRegistry::new();
        assert_matches!(registry.register_submenu(&[], "Root"), Err(MenuError::EmptyPath));
    }
}
