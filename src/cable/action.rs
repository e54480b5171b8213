//! Declarative mapping of named actions onto `perform` calls.
//!
//! An [`ActionTable`] lists the actions a channel understands together with
//! the ordered names of their parameters. It is checked once at construction;
//! afterwards positional arguments are turned into the payload of a message
//! command.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use serde_json::{Map, Value};

use super::subscription::{ACTION_KEY, Subscription};
use crate::Result;
use crate::error::Error;

/// One server-side action and the ordered names of its parameters.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub name: String,
    pub params: Vec<String>,
}

impl Action {
    #[must_use]
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Append a parameter.
    #[must_use]
    pub fn param<S: Into<String>>(mut self, name: S) -> Self {
        self.params.push(name.into());
        self
    }
}

/// Validated set of [`Action`]s.
///
/// # Example
///
/// ```
/// use actioncable_client::cable::{Action, ActionTable};
/// use serde_json::json;
///
/// let table = ActionTable::new([
///     Action::new("appear").param("on"),
///     Action::new("away"),
/// ])?;
///
/// let payload = table.payload("appear", vec![json!("home")])?;
/// assert_eq!(payload["on"], "home");
/// # Ok::<(), actioncable_client::error::Error>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct ActionTable {
    actions: HashMap<String, Action>,
}

impl ActionTable {
    /// Build a table.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty or duplicate action name, or
    /// for a parameter that is repeated or named `action`.
    pub fn new<I: IntoIterator<Item = Action>>(actions: I) -> Result<Self> {
        let mut table = HashMap::new();

        for action in actions {
            if action.name.is_empty() {
                return Err(Error::validation("action name cannot be empty"));
            }
            for (index, param) in action.params.iter().enumerate() {
                if param == ACTION_KEY {
                    return Err(Error::validation(format!(
                        "action '{}': '{ACTION_KEY}' is reserved and cannot be a parameter",
                        action.name
                    )));
                }
                if action.params[..index].contains(param) {
                    return Err(Error::validation(format!(
                        "action '{}': duplicate parameter '{param}'",
                        action.name
                    )));
                }
            }

            match table.entry(action.name.clone()) {
                Entry::Occupied(_) => {
                    return Err(Error::validation(format!(
                        "duplicate action '{}'",
                        action.name
                    )));
                }
                Entry::Vacant(entry) => {
                    entry.insert(action);
                }
            }
        }

        Ok(Self { actions: table })
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Pair `args` with the parameter names of `name`, in declaration order.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the action is unknown or the number of
    /// arguments does not match its parameters.
    pub fn payload(&self, name: &str, args: Vec<Value>) -> Result<Map<String, Value>> {
        let action = self
            .get(name)
            .ok_or_else(|| Error::validation(format!("unknown action '{name}'")))?;

        if args.len() != action.params.len() {
            return Err(Error::validation(format!(
                "action '{name}' takes {} argument(s) but {} were given",
                action.params.len(),
                args.len()
            )));
        }

        Ok(action.params.iter().cloned().zip(args).collect())
    }

    /// Perform `name` on `subscription` with positional `args`.
    ///
    /// Returns `Ok(false)` if the connection is not open.
    pub fn perform(
        &self,
        subscription: &Subscription,
        name: &str,
        args: Vec<Value>,
    ) -> Result<bool> {
        let payload = self.payload(name, args)?;
        Ok(subscription.perform_with(name, payload))
    }
}
