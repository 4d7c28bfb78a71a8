//! Fontes do conjunto de arquivos alterados sob revisão.
//!
//! O trait [`ChangeProvider`] abstrai de onde vem a lista: [`StaticChanges`]
//! para listas fixas (testes, integrações externas) e [`GitChanges`], que
//! consulta o repositório via libgit2 (working tree + index contra HEAD).
//! O resultado é sempre um [`ChangeSet`] com caminhos normalizados.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use git2::{Repository, Status, StatusOptions};
use parking_lot::Mutex;

/// Normaliza um caminho para comparação: barras `/`, sem prefixo `./`.
pub fn normalize_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut rest = unified.as_str();
    while let Some(stripped) = rest.strip_prefix("./") {
        rest = stripped;
    }
    rest.to_string()
}

/// Conjunto imutável de arquivos alterados, já normalizados.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    files: BTreeSet<String>,
}

impl ChangeSet {
    pub fn new<I, P>(files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<str>,
    {
        let files = files
            .into_iter()
            .map(|p| normalize_path(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        Self { files }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains(&normalize_path(path))
    }

    /// Verdadeiro se algum arquivo alterado aparece no texto.
    pub fn mentioned_in(&self, text: &str) -> bool {
        let text = text.replace('\\', "/");
        self.files.iter().any(|f| text.contains(f.as_str()))
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Fonte do conjunto de arquivos alterados.
pub trait ChangeProvider: Send + Sync {
    fn changed_files(&self) -> Result<ChangeSet>;
}

/// Lista fixa de arquivos alterados.
#[derive(Debug, Clone, Default)]
pub struct StaticChanges {
    files: Vec<String>,
}

impl StaticChanges {
    pub fn new<I, P>(files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            files: files.into_iter().map(Into::into).collect(),
        }
    }
}

impl ChangeProvider for StaticChanges {
    fn changed_files(&self) -> Result<ChangeSet> {
        Ok(ChangeSet::new(&self.files))
    }
}

/// Arquivos alterados de um repositório git, via libgit2.
///
/// Inclui modificações no index e na working tree em relação ao HEAD, além
/// de arquivos não rastreados. Arquivos ignorados ficam de fora.
///
/// `git2::Repository` não é `Sync`; o acesso passa por um mutex.
pub struct GitChanges {
    repo: Mutex<Repository>,
}

impl GitChanges {
    /// Abre um repositório git existente no caminho fornecido.
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::open(path).context("failed to open git repository")?;
        Ok(Self {
            repo: Mutex::new(repo),
        })
    }

    /// Retorna o nome da branch atual.
    pub fn current_branch(&self) -> Result<String> {
        let repo = self.repo.lock();
        let head = repo.head()?;
        let name = head
            .shorthand()
            .context("branch name is not valid UTF-8")?
            .to_string();
        Ok(name)
    }
}

impl ChangeProvider for GitChanges {
    fn changed_files(&self) -> Result<ChangeSet> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);

        let repo = self.repo.lock();
        let statuses = repo
            .statuses(Some(&mut opts))
            .context("failed to read git status")?;

        let changed = Status::INDEX_NEW
            | Status::INDEX_MODIFIED
            | Status::INDEX_DELETED
            | Status::INDEX_RENAMED
            | Status::INDEX_TYPECHANGE
            | Status::WT_NEW
            | Status::WT_MODIFIED
            | Status::WT_DELETED
            | Status::WT_RENAMED
            | Status::WT_TYPECHANGE;

        let files: Vec<String> = statuses
            .iter()
            .filter(|entry| entry.status().intersects(changed))
            .filter_map(|entry| entry.path().map(str::to_string))
            .collect();
        Ok(ChangeSet::new(files))
    }
}
