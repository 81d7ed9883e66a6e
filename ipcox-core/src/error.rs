use thiserror::Error;

pub type Result<T, E = HandleError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("Values of kind '{kind}' have no identity and cannot be registered for replacement")]
    NotReplaceable { kind: &'static str },
}

#[derive(Debug, Error)]
pub enum MenuError {
    #[error("A menu path must contain at least one element")]
    EmptyPath,

    #[error("Menu node '{id}' is an action, not a submenu")]
    NotASubmenu { id: String },

    #[error("No submenu is registered at path '{path}'")]
    SubmenuNotFound { path: String },

    #[error("Submenu '{id}' cannot be linked to itself")]
    LinkToSelf { id: String },

    #[error("Linking submenu '{child}' into '{parent}' would create a cycle")]
    Cycle { parent: String, child: String },
}
