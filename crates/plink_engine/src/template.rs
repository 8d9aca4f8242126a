//! Templates, the block capture protocol and inheritance.
//!
//! A [`Template`] runs its body once per [`Template::render`] call. While the
//! body runs, text goes either to the template's top-level output or, when a
//! region has been opened with [`Template::begin`], to every open region at
//! once. Closing a named region stores it in the block map, where parents in
//! the extends chain can read it back with [`Template::get_block`].

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::{debug, warn};

use crate::block::Block;
use crate::config::DEFAULT_MAX_DEPTH;
use crate::environment::{builtin_filter, Environment, EnvironmentInner, Filter, Variables};
use crate::error::{TemplateError, TemplateResult};
use crate::loader::{FileLoader, TemplateBody, TemplateLoader};

/// Block name carrying a child's top-level output into its parent.
pub const CONTENT_BLOCK: &str = "content";

/// Emitted after an anonymous block closed without a filter.
pub const ANONYMOUS_BLOCK_WARNING: &str =
    "WARNING: a block with no name and no endblock parameter serves no purpose!";

/// An open capture region.
struct Frame {
    block: Block,
    /// Lengths of the enclosing regions when this one opened.
    marks: Vec<usize>,
}

enum Close<'f> {
    Raw,
    Escape,
    Filter(Box<dyn FnOnce(&str) -> String + 'f>),
}

/// A template bound to a name (or built in memory) and optionally to an
/// [`Environment`].
pub struct Template {
    name: Option<String>,
    path: Option<PathBuf>,
    environment: Option<Weak<EnvironmentInner>>,
    body: Option<(PathBuf, Arc<dyn TemplateBody>)>,
    depth: usize,

    // Per-render state, cleared when a render finishes.
    content: Block,
    stack: Vec<Frame>,
    blocks: HashMap<String, Block>,
    inherited: HashSet<String>,
    extends: Option<String>,
    locals: Variables,
    content_read: Cell<bool>,
}

impl Template {
    /// Create a template without an environment.
    ///
    /// `path` is used as-is to load a script from disk. With `None` the
    /// template has no body and renders whatever was built programmatically.
    pub fn new(path: Option<impl Into<PathBuf>>) -> Self {
        let path: Option<PathBuf> = path.map(Into::into);
        let name = path.as_ref().map(|p| p.to_string_lossy().into_owned());
        Self::build(name, path, None, 0)
    }

    pub(crate) fn with_environment(environment: &Environment, name: Option<&str>) -> Self {
        let path = name.map(|n| environment.resolve_path(n));
        Self::build(
            name.map(String::from),
            path,
            Some(Arc::downgrade(environment.inner())),
            0,
        )
    }

    fn build(
        name: Option<String>,
        path: Option<PathBuf>,
        environment: Option<Weak<EnvironmentInner>>,
        depth: usize,
    ) -> Self {
        Self {
            name,
            path,
            environment,
            body: None,
            depth,
            content: Block::new(None),
            stack: Vec::new(),
            blocks: HashMap::new(),
            inherited: HashSet::new(),
            extends: None,
            locals: Variables::new(),
            content_read: Cell::new(false),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Resolved path of the backing body, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The owning environment, if it is still alive.
    pub fn environment(&self) -> Option<Environment> {
        self.environment
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Environment::from_inner)
    }

    fn resolve(&self, name: &str) -> PathBuf {
        match self.environment() {
            Some(env) => env.resolve_path(name),
            None => PathBuf::from(name),
        }
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    /// Write text to every open region, or to the top-level output when no
    /// region is open.
    pub fn emit(&mut self, text: &str) {
        if self.stack.is_empty() {
            self.content.append(text);
        } else {
            for frame in &mut self.stack {
                frame.block.append(text);
            }
        }
    }

    /// Top-level output produced so far.
    pub fn output(&self) -> &str {
        self.content.content()
    }

    /// Number of currently open regions.
    pub fn open_regions(&self) -> usize {
        self.stack.len()
    }

    // ------------------------------------------------------------------
    // Block capture protocol
    // ------------------------------------------------------------------

    /// Assign `value` to the block `name` without opening a region.
    pub fn block(&mut self, name: &str, value: impl Into<String>) -> TemplateResult<()> {
        let value = value.into();
        if name.is_empty() {
            return Err(TemplateError::invalid(format!(
                "You are assigning a value of {} to a block with no name!",
                value
            )));
        }
        self.store_block(Block::with_content(name, value));
        Ok(())
    }

    /// Open a capture region. Everything emitted until the matching close is
    /// captured by this region and by every region enclosing it.
    pub fn begin(&mut self, name: Option<&str>) {
        let name = name.filter(|n| !n.is_empty()).map(String::from);
        let marks = self.stack.iter().map(|f| f.block.len()).collect();
        self.stack.push(Frame {
            block: Block::new(name),
            marks,
        });
    }

    /// Close the innermost region.
    ///
    /// A named block is stored under its name. An anonymous block is written
    /// to the enclosing output followed by [`ANONYMOUS_BLOCK_WARNING`].
    pub fn endblock(&mut self) -> TemplateResult<Block> {
        self.close(Close::Raw)
    }

    /// Close the innermost region, passing its content through `filter`.
    pub fn endblock_with<F>(&mut self, filter: F) -> TemplateResult<Block>
    where
        F: FnOnce(&str) -> String,
    {
        self.close(Close::Filter(Box::new(filter)))
    }

    /// Close the innermost region, escaping its content.
    pub fn endescape(&mut self) -> TemplateResult<Block> {
        self.close(Close::Escape)
    }

    fn close(&mut self, mode: Close<'_>) -> TemplateResult<Block> {
        let Frame { mut block, marks } = self
            .stack
            .pop()
            .ok_or_else(|| TemplateError::invalid("endblock called with no open block"))?;

        let unfiltered = matches!(mode, Close::Raw);
        match mode {
            Close::Raw => {}
            Close::Escape => {
                let escaped = block.escape();
                block.set_content(escaped);
                block.set_escaped(true);
            }
            Close::Filter(filter) => {
                let filtered = filter(block.content());
                block.set_content(filtered);
            }
        }

        if block.name().is_some() {
            self.store_block(block.clone());
            return Ok(block);
        }

        // The enclosing regions already saw the raw bytes; replace them with
        // the block's final form.
        for (frame, mark) in self.stack.iter_mut().zip(marks) {
            frame.block.truncate(mark);
        }
        self.emit(block.content());
        if unfiltered {
            warn!(
                template = self.name.as_deref().unwrap_or("<memory>"),
                "Anonymous block closed without a filter"
            );
            self.emit(ANONYMOUS_BLOCK_WARNING);
        }
        Ok(block)
    }

    fn store_block(&mut self, block: Block) {
        let Some(name) = block.name().map(String::from) else {
            return;
        };
        if self.inherited.contains(&name) {
            debug!("Block {} already defined by an extending template", name);
            return;
        }
        debug!("Storing block {}", name);
        self.blocks.insert(name, block);
    }

    // ------------------------------------------------------------------
    // Named block access
    // ------------------------------------------------------------------

    /// Look up a stored block. Absent names give `None`.
    pub fn get_block(&self, name: &str) -> Option<&Block> {
        if name == CONTENT_BLOCK {
            self.content_read.set(true);
        }
        self.blocks.get(name)
    }

    /// Content of a stored block, or the empty string.
    pub fn block_content(&self, name: &str) -> &str {
        self.get_block(name).map(Block::content).unwrap_or("")
    }

    pub fn has_block(&self, name: &str) -> bool {
        self.blocks.contains_key(name)
    }

    /// Set the content of `name`, creating the block if needed.
    pub fn set_block(&mut self, name: &str, value: impl Into<String>) {
        match self.blocks.get_mut(name) {
            Some(block) => block.set_content(value),
            None => {
                self.blocks
                    .insert(name.to_string(), Block::with_content(name, value));
            }
        }
    }

    pub fn remove_block(&mut self, name: &str) -> Option<Block> {
        self.inherited.remove(name);
        self.blocks.remove(name)
    }

    pub fn blocks(&self) -> &HashMap<String, Block> {
        &self.blocks
    }

    /// Replace the block map wholesale.
    pub fn set_blocks(&mut self, blocks: HashMap<String, Block>) {
        self.inherited.clear();
        self.blocks = blocks;
    }

    /// Install blocks handed up by an extending template. Later definitions
    /// in this template's body do not replace them.
    fn inherit_blocks(&mut self, blocks: HashMap<String, Block>) {
        self.inherited = blocks.keys().cloned().collect();
        self.blocks = blocks;
    }

    /// Take the block map, folding the top-level output in under
    /// [`CONTENT_BLOCK`].
    ///
    /// An existing `content` block gets the output appended. The one
    /// exception is an inherited `content` that this template read while
    /// rendering: the output already embeds it, so it replaces the block.
    fn compose_blocks(&mut self) -> HashMap<String, Block> {
        let mut blocks = std::mem::take(&mut self.blocks);
        let output = std::mem::take(&mut self.content).into_content();
        let wraps = self.inherited.contains(CONTENT_BLOCK) && self.content_read.get();

        match blocks.get_mut(CONTENT_BLOCK) {
            Some(existing) if !wraps => existing.append(&output),
            _ => {
                blocks.insert(
                    CONTENT_BLOCK.to_string(),
                    Block::with_content(CONTENT_BLOCK, output),
                );
            }
        }
        blocks
    }

    // ------------------------------------------------------------------
    // Inheritance
    // ------------------------------------------------------------------

    /// Extend the template called `name`.
    ///
    /// Extending this template's own path is ignored. The first target set
    /// during a render is kept.
    pub fn extend(&mut self, name: &str) {
        let target = self.resolve(name);
        if self.path.as_deref() == Some(target.as_path()) {
            warn!("Template {:?} attempted to extend itself", target);
            return;
        }
        match &self.extends {
            Some(current) if current != name => {
                warn!(
                    "Template already extends {}, ignoring extend({})",
                    current, name
                );
            }
            Some(_) => {}
            None => {
                debug!("Template extends {}", name);
                self.extends = Some(name.to_string());
            }
        }
    }

    /// Name of the template being extended, if any.
    pub fn extends(&self) -> Option<&str> {
        self.extends.as_deref()
    }

    fn max_depth(&self) -> usize {
        self.environment()
            .map(|env| env.config().max_depth)
            .unwrap_or(DEFAULT_MAX_DEPTH)
    }

    fn render_parent(&mut self, parent: String) -> TemplateResult<String> {
        let depth = self.depth + 1;
        if depth > self.max_depth() {
            return Err(TemplateError::InheritanceDepth {
                name: parent,
                depth,
            });
        }

        let blocks = self.compose_blocks();
        let path = self.resolve(&parent);
        let mut extended = Self::build(Some(parent), Some(path), self.environment.clone(), depth);
        extended.inherit_blocks(blocks);

        debug!(
            "Rendering parent {} at depth {}",
            extended.name().unwrap_or_default(),
            depth
        );
        extended.render(Variables::new())
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    /// Read a variable bound to this render, falling back to the
    /// environment's shared variables.
    pub fn var(&self, name: &str) -> TemplateResult<Value> {
        self.var_opt(name)
            .ok_or_else(|| TemplateError::MissingVariable(name.to_string()))
    }

    pub fn var_opt(&self, name: &str) -> Option<Value> {
        self.locals
            .get(name)
            .cloned()
            .or_else(|| self.environment().and_then(|env| env.get_opt(name)))
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.locals.contains_key(name)
            || self.environment().is_some_and(|env| env.has(name))
    }

    /// Write a variable. Bound variables are updated in place; anything else
    /// goes to the environment, or to the locals when there is none.
    pub fn set_var(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        if self.locals.contains_key(name) {
            self.locals.insert(name.to_string(), value);
            return;
        }
        match self.environment() {
            Some(env) => env.set(name, value),
            None => {
                self.locals.insert(name.to_string(), value);
            }
        }
    }

    /// Bind a variable for this render only, shadowing the environment.
    pub fn set_local(&mut self, name: &str, value: impl Into<Value>) {
        self.locals.insert(name.to_string(), value.into());
    }

    pub fn strict_variables(&self) -> bool {
        self.environment()
            .map(|env| env.config().strict_variables)
            .unwrap_or(true)
    }

    /// Look up a filter registered on the environment, or a built-in one.
    pub fn filter(&self, name: &str) -> Option<Filter> {
        match self.environment() {
            Some(env) => env.filter(name),
            None => builtin_filter(name),
        }
    }

    // ------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------

    /// Render the template with `variables` bound.
    ///
    /// Per-render state is cleared afterwards, whether or not rendering
    /// succeeded, so the same template can be rendered again.
    pub fn render(&mut self, variables: Variables) -> TemplateResult<String> {
        let result = self.render_pass(variables);
        self.reset();
        result
    }

    fn render_pass(&mut self, variables: Variables) -> TemplateResult<String> {
        for (key, value) in variables {
            self.locals.entry(key).or_insert(value);
        }

        if let Some(name) = self.name.clone() {
            let path = self.resolve(&name);
            let body = self.load_body(&path)?;
            self.path = Some(path);

            body.execute(self)?;

            if let Some(frame) = self.stack.last() {
                return Err(TemplateError::invalid(format!(
                    "block {} was never closed",
                    frame.block.name().unwrap_or("<anonymous>")
                )));
            }
        }

        match self.extends.take() {
            Some(parent) => self.render_parent(parent),
            None => Ok(std::mem::take(&mut self.content).into_content()),
        }
    }

    fn load_body(&mut self, path: &Path) -> TemplateResult<Arc<dyn TemplateBody>> {
        if let Some((loaded, body)) = &self.body {
            if loaded == path {
                return Ok(Arc::clone(body));
            }
        }

        let body = match self.environment() {
            Some(env) => env.loader().load(path)?,
            None => FileLoader::new().load(path)?,
        };
        self.body = Some((path.to_path_buf(), Arc::clone(&body)));
        Ok(body)
    }

    fn reset(&mut self) {
        self.content = Block::new(None);
        self.stack.clear();
        self.blocks.clear();
        self.inherited.clear();
        self.extends = None;
        self.locals.clear();
        self.content_read.set(false);
    }
}

impl fmt::Write for Template {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.emit(s);
        Ok(())
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("depth", &self.depth)
            .field("open_regions", &self.stack.len())
            .field("blocks", &self.blocks.keys().collect::<Vec<_>>())
            .field("extends", &self.extends)
            .finish()
    }
}
