//! Document generation from the template directory.
//!
//! Templates are `.docx` files anywhere below the configured template directory. The
//! operator picks a client and/or a caretaker, a set of templates and a folder name; every
//! template is rendered into `<target>/<folder>` under its placeholder-resolved file name,
//! optionally converted to PDF.
//!
//! Template groups are named selections of templates stored in the configuration so that a
//! recurring set (for example everything needed for a new contract) can be chosen at once.

use crate::config::{ConfigStore, CoreConfig};
use crate::constants::OFFICE_LOCK_PREFIX;
use crate::convert::{ConversionOutcome, PdfConverter};
use crate::dates::normalize_date_fields;
use crate::key::{find_index, EntityKind, RecordKey};
use crate::record::Record;
use crate::store::read_records;
use crate::template::{render, resolve_filename, DataContext};
use crate::validation::{validate_folder_name, validate_relative_template_path};
use crate::{CareError, CareResult};
use homecare_types::NonEmptyText;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ============================================================================
// TEMPLATE TREE
// ============================================================================

/// An entry of the template directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TemplateNode {
    Folder {
        name: String,
        #[serde(rename = "relPath")]
        rel_path: String,
        children: Vec<TemplateNode>,
    },
    File {
        name: String,
        #[serde(rename = "relPath")]
        rel_path: String,
    },
}

impl TemplateNode {
    pub fn name(&self) -> &str {
        match self {
            TemplateNode::Folder { name, .. } | TemplateNode::File { name, .. } => name,
        }
    }
}

/// Whether `name` is a usable `.docx` template file name.
pub(crate) fn is_template_file(name: &str) -> bool {
    !name.starts_with(OFFICE_LOCK_PREFIX) && name.to_lowercase().ends_with(".docx")
}

/// Lists folders and `.docx` files below `dir`, sorted by name at every level.
///
/// Office lock files (`~$…`) are skipped. A missing directory yields an empty tree.
/// Relative paths always use `/`.
pub fn template_tree(dir: &Path) -> CareResult<Vec<TemplateNode>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    build_tree(dir, "")
}

fn build_tree(dir: &Path, rel: &str) -> CareResult<Vec<TemplateNode>> {
    let mut nodes = Vec::new();
    for entry in fs::read_dir(dir).map_err(CareError::FileRead)? {
        let entry = entry.map_err(CareError::FileRead)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(OFFICE_LOCK_PREFIX) {
            continue;
        }
        let rel_path = if rel.is_empty() {
            name.clone()
        } else {
            format!("{rel}/{name}")
        };
        let file_type = entry.file_type().map_err(CareError::FileRead)?;
        if file_type.is_dir() {
            let children = build_tree(&entry.path(), &rel_path)?;
            nodes.push(TemplateNode::Folder {
                name,
                rel_path,
                children,
            });
        } else if is_template_file(&name) {
            nodes.push(TemplateNode::File { name, rel_path });
        }
    }
    nodes.sort_by(|a, b| a.name().cmp(b.name()));
    Ok(nodes)
}

/// Relative paths of every template file in `tree`, sorted.
pub fn template_files(tree: &[TemplateNode]) -> Vec<String> {
    fn collect(nodes: &[TemplateNode], out: &mut Vec<String>) {
        for node in nodes {
            match node {
                TemplateNode::File { rel_path, .. } => out.push(rel_path.clone()),
                TemplateNode::Folder { children, .. } => collect(children, out),
            }
        }
    }
    let mut files = Vec::new();
    collect(tree, &mut files);
    files.sort();
    files
}

// ============================================================================
// TEMPLATE GROUPS
// ============================================================================

/// A named selection of templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateGroup {
    pub name: String,
    pub templates: Vec<String>,
}

/// Groups in display order, each reduced to templates that still exist.
///
/// Groups missing from the stored order follow the ordered ones alphabetically.
pub fn list_groups(store: &ConfigStore, available: &[String]) -> Vec<TemplateGroup> {
    let cfg = store.config();
    let mut names: Vec<&String> = cfg
        .template_group_order
        .iter()
        .filter(|name| cfg.template_groups.contains_key(*name))
        .collect();
    for name in cfg.template_groups.keys() {
        if !names.contains(&name) {
            names.push(name);
        }
    }

    names
        .into_iter()
        .map(|name| TemplateGroup {
            name: name.clone(),
            templates: cfg.template_groups[name]
                .iter()
                .filter(|t| available.contains(t))
                .cloned()
                .collect(),
        })
        .collect()
}

/// Creates an empty group at the end of the display order.
///
/// # Errors
///
/// Returns `CareError::InvalidInput` if a group with that name exists.
pub fn create_group(store: &mut ConfigStore, name: &NonEmptyText) -> CareResult<()> {
    if store.config().template_groups.contains_key(name.as_str()) {
        return Err(CareError::InvalidInput(format!(
            "template group '{}' already exists",
            name
        )));
    }
    store.update(|cfg| {
        cfg.template_groups.insert(name.to_string(), Vec::new());
        cfg.template_group_order.push(name.to_string());
    })
}

/// Deletes a group. Returns `false` if it did not exist.
pub fn delete_group(store: &mut ConfigStore, name: &str) -> CareResult<bool> {
    if !store.config().template_groups.contains_key(name) {
        return Ok(false);
    }
    store.update(|cfg| {
        cfg.template_groups.remove(name);
        cfg.template_group_order.retain(|n| n != name);
    })?;
    Ok(true)
}

/// Renames a group, keeping its position. Returns `false` if `old` did not exist.
///
/// # Errors
///
/// Returns `CareError::InvalidInput` if a different group is already called `new`.
pub fn rename_group(store: &mut ConfigStore, old: &str, new: &NonEmptyText) -> CareResult<bool> {
    if !store.config().template_groups.contains_key(old) {
        return Ok(false);
    }
    if old == new.as_str() {
        return Ok(true);
    }
    if store.config().template_groups.contains_key(new.as_str()) {
        return Err(CareError::InvalidInput(format!(
            "template group '{}' already exists",
            new
        )));
    }
    store.update(|cfg| {
        if let Some(templates) = cfg.template_groups.remove(old) {
            cfg.template_groups.insert(new.to_string(), templates);
        }
        for entry in cfg
            .template_group_order
            .iter_mut()
            .filter(|n| n.as_str() == old)
        {
            *entry = new.to_string();
        }
    })?;
    Ok(true)
}

/// Replaces the templates of a group. Returns `false` if the group does not exist.
pub fn set_group_templates(
    store: &mut ConfigStore,
    name: &str,
    templates: Vec<String>,
) -> CareResult<bool> {
    if !store.config().template_groups.contains_key(name) {
        return Ok(false);
    }
    for template in &templates {
        validate_relative_template_path(template)?;
    }
    store.update(|cfg| {
        cfg.template_groups.insert(name.to_owned(), templates);
    })?;
    Ok(true)
}

/// Stores a new display order for the groups.
pub fn set_group_order(store: &mut ConfigStore, order: Vec<String>) -> CareResult<()> {
    store.update(|cfg| cfg.template_group_order = order)
}

// ============================================================================
// GENERATION
// ============================================================================

/// What to generate.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub client: Option<RecordKey>,
    pub caretaker: Option<RecordKey>,
    /// Template paths relative to the template directory.
    pub templates: Vec<String>,
    /// Directory in which the output folder is created.
    pub target_dir: PathBuf,
    pub folder_name: String,
    pub pdf: bool,
}

/// Outcome of a generation batch. Failures of single templates do not stop the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationReport {
    pub output_dir: PathBuf,
    pub written: Vec<PathBuf>,
    pub warnings: Vec<String>,
    /// `(template, reason)` for every template that produced no file.
    pub failures: Vec<(String, String)>,
}

/// Renders templates for active clients and caretakers.
pub struct DocumentService {
    cfg: Arc<CoreConfig>,
    converter: Box<dyn PdfConverter>,
}

impl DocumentService {
    pub fn new(cfg: Arc<CoreConfig>, converter: Box<dyn PdfConverter>) -> Self {
        Self { cfg, converter }
    }

    /// The template tree of the configured template directory.
    pub fn tree(&self) -> CareResult<Vec<TemplateNode>> {
        template_tree(self.cfg.template_dir())
    }

    fn load_person(&self, kind: EntityKind, key: &RecordKey) -> CareResult<Record> {
        let records = read_records(&self.cfg.active_file(kind))?;
        let idx = find_index(&records, kind, key)
            .ok_or_else(|| CareError::RecordNotFound(format!("{} {}", kind, key)))?;
        let mut record = records[idx].clone();
        normalize_date_fields(&mut record, kind);
        Ok(record)
    }

    /// Generates one document per selected template.
    ///
    /// # Errors
    ///
    /// Returns `CareError::InvalidInput` if no template or neither a client nor a caretaker
    /// was selected, or the folder name is unsafe; `CareError::RecordNotFound` if a
    /// selected key is unknown; `CareError::DirCreation` if the output folder cannot be
    /// created. Problems with individual templates are reported in the
    /// [`GenerationReport`].
    pub fn generate(&self, request: &GenerationRequest) -> CareResult<GenerationReport> {
        if request.templates.is_empty() {
            return Err(CareError::InvalidInput(
                "select at least one template".into(),
            ));
        }
        if request.client.is_none() && request.caretaker.is_none() {
            return Err(CareError::InvalidInput(
                "select at least a client or a caretaker".into(),
            ));
        }
        validate_folder_name(&request.folder_name)?;

        let client = request
            .client
            .as_ref()
            .map(|key| self.load_person(EntityKind::Client, key))
            .transpose()?;
        let caretaker = request
            .caretaker
            .as_ref()
            .map(|key| self.load_person(EntityKind::Caretaker, key))
            .transpose()?;
        let ctx = DataContext::merge(client.as_ref(), caretaker.as_ref());

        let output_dir = request.target_dir.join(request.folder_name.trim());
        fs::create_dir_all(&output_dir).map_err(|source| CareError::DirCreation {
            path: output_dir.clone(),
            source,
        })?;

        let mut report = GenerationReport {
            output_dir: output_dir.clone(),
            ..GenerationReport::default()
        };

        for rel_path in &request.templates {
            match self.generate_one(rel_path, &ctx, &output_dir, request.pdf, &mut report) {
                Ok(path) => report.written.push(path),
                Err(e) => {
                    tracing::warn!("template {} failed: {}", rel_path, e);
                    report.failures.push((rel_path.clone(), e.to_string()));
                }
            }
        }

        tracing::info!(
            "generated {} documents in {} ({} failed)",
            report.written.len(),
            output_dir.display(),
            report.failures.len()
        );
        Ok(report)
    }

    fn generate_one(
        &self,
        rel_path: &str,
        ctx: &DataContext,
        output_dir: &Path,
        pdf: bool,
        report: &mut GenerationReport,
    ) -> CareResult<PathBuf> {
        validate_relative_template_path(rel_path)?;
        let template_path = self.cfg.template_dir().join(rel_path);
        let bytes = fs::read(&template_path).map_err(CareError::FileRead)?;
        let rendered = render(&bytes, ctx)?;
        for name in &rendered.missing {
            report
                .warnings
                .push(format!("{}: Platzhalter [[{}]] ohne Wert", rel_path, name));
        }

        let file_name = Path::new(rel_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| rel_path.to_owned());
        let (file_name, missing) = resolve_filename(&file_name, ctx);
        for name in missing {
            report.warnings.push(format!(
                "{}: Platzhalter [[{}]] im Dateinamen konnte nicht ersetzt werden",
                rel_path, name
            ));
        }

        let docx_path = output_dir.join(file_name);
        fs::write(&docx_path, &rendered.bytes).map_err(CareError::FileWrite)?;

        if !pdf {
            return Ok(docx_path);
        }
        match self.converter.convert(&docx_path, output_dir) {
            ConversionOutcome::Converted(pdf_path) => {
                if let Err(e) = fs::remove_file(&docx_path) {
                    tracing::warn!("could not remove {}: {}", docx_path.display(), e);
                }
                Ok(pdf_path)
            }
            ConversionOutcome::Unavailable(reason) => {
                report.warnings.push(format!(
                    "{}: PDF-Konvertierung nicht möglich, DOCX behalten ({})",
                    rel_path, reason
                ));
                Ok(docx_path)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::write_records;
    use crate::template::tests::{document_xml, docx_with_body};
    use tempfile::TempDir;

    struct NoConverter;

    impl PdfConverter for NoConverter {
        fn convert(&self, _docx: &Path, _out_dir: &Path) -> ConversionOutcome {
            ConversionOutcome::Unavailable("not installed".into())
        }
    }

    /// Writes a `.pdf` next to the input, like a real converter.
    struct FakeConverter;

    impl PdfConverter for FakeConverter {
        fn convert(&self, docx: &Path, out_dir: &Path) -> ConversionOutcome {
            let pdf = crate::convert::pdf_path_for(docx, out_dir);
            match fs::write(&pdf, b"%PDF") {
                Ok(()) => ConversionOutcome::Converted(pdf),
                Err(e) => ConversionOutcome::Unavailable(e.to_string()),
            }
        }
    }

    fn setup(temp_dir: &TempDir, converter: Box<dyn PdfConverter>) -> DocumentService {
        let root = temp_dir.path();
        let cfg = CoreConfig::new(root.to_path_buf(), root.join("Daten"), root.join("AlteDaten"))
            .with_template_dirs(root.join("Vorlagen"), root.join("RechnungsVorlagen"));

        let mut client = Record::from_pairs([("kfname", "Meier"), ("kvname", "Eva")]);
        client.set("kgebdat", 45000.0);
        write_records(&cfg.active_file(EntityKind::Client), &[client]).expect("seed clients");
        write_records(
            &cfg.active_file(EntityKind::Caretaker),
            &[Record::from_pairs([("Vor.Nam", "Maria"), ("Fam. Nam", "Klein")])],
        )
        .expect("seed caretakers");

        let vertrag = root.join("Vorlagen/Vertrag");
        fs::create_dir_all(&vertrag).expect("template dir");
        fs::write(
            vertrag.join("Vertrag [[kfname]].docx"),
            docx_with_body(
                "<w:p><w:r><w:t>[[kvname]] [[kfname]], geb. [[kgebdat]], betreut von [[Vor.Nam]] [[Fehlt]]</w:t></w:r></w:p>",
            ),
        )
        .expect("template");
        fs::write(root.join("Vorlagen/~$Vertrag.docx"), b"lock").expect("lock file");
        fs::write(root.join("Vorlagen/Notiz.txt"), b"ignore").expect("other file");
        fs::write(root.join("Vorlagen/Kaputt.docx"), b"no zip").expect("broken template");

        DocumentService::new(Arc::new(cfg), converter)
    }

    fn request(temp_dir: &TempDir, templates: &[&str], pdf: bool) -> GenerationRequest {
        GenerationRequest {
            client: Some(RecordKey::parse("meier__eva")),
            caretaker: Some(RecordKey::parse("maria__klein")),
            templates: templates.iter().map(|t| t.to_string()).collect(),
            target_dir: temp_dir.path().join("Ausgabe"),
            folder_name: "Vertragsmappe_Meier".into(),
            pdf,
        }
    }

    #[test]
    fn test_template_tree_lists_folders_and_docx_only() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let service = setup(&temp_dir, Box::new(NoConverter));

        let tree = service.tree().expect("tree");
        let names: Vec<&str> = tree.iter().map(TemplateNode::name).collect();
        assert_eq!(names, vec!["Kaputt.docx", "Vertrag"]);
        assert_eq!(
            template_files(&tree),
            vec!["Kaputt.docx", "Vertrag/Vertrag [[kfname]].docx"]
        );
    }

    #[test]
    fn test_template_tree_of_missing_dir_is_empty() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let tree = template_tree(&temp_dir.path().join("fehlt")).expect("tree");
        assert!(tree.is_empty());
    }

    #[test]
    fn test_generate_renders_and_names_documents() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let service = setup(&temp_dir, Box::new(NoConverter));

        let report = service
            .generate(&request(&temp_dir, &["Vertrag/Vertrag [[kfname]].docx"], false))
            .expect("generate");

        let expected = temp_dir
            .path()
            .join("Ausgabe/Vertragsmappe_Meier/Vertrag Meier.docx");
        assert_eq!(report.written, vec![expected.clone()]);
        assert!(report.failures.is_empty());
        assert_eq!(report.warnings.len(), 1);

        let xml = document_xml(&fs::read(expected).expect("output exists"));
        assert!(xml.contains("Eva Meier, geb. 15.03.2023, betreut von Maria "));
        assert!(xml.contains("[[Fehlt]]"));
    }

    #[test]
    fn test_generate_collects_failures_and_continues() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let service = setup(&temp_dir, Box::new(NoConverter));

        let report = service
            .generate(&request(
                &temp_dir,
                &["Kaputt.docx", "Vertrag/Vertrag [[kfname]].docx", "../x.docx"],
                false,
            ))
            .expect("generate");
        assert_eq!(report.written.len(), 1);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].0, "Kaputt.docx");
    }

    #[test]
    fn test_generate_pdf_replaces_docx_when_converted() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let service = setup(&temp_dir, Box::new(FakeConverter));

        let report = service
            .generate(&request(&temp_dir, &["Vertrag/Vertrag [[kfname]].docx"], true))
            .expect("generate");
        let out = temp_dir.path().join("Ausgabe/Vertragsmappe_Meier");
        assert_eq!(report.written, vec![out.join("Vertrag Meier.pdf")]);
        assert!(!out.join("Vertrag Meier.docx").exists());
    }

    #[test]
    fn test_generate_pdf_keeps_docx_when_unavailable() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let service = setup(&temp_dir, Box::new(NoConverter));

        let report = service
            .generate(&request(&temp_dir, &["Vertrag/Vertrag [[kfname]].docx"], true))
            .expect("generate");
        let out = temp_dir.path().join("Ausgabe/Vertragsmappe_Meier");
        assert_eq!(report.written, vec![out.join("Vertrag Meier.docx")]);
        assert!(report.warnings.iter().any(|w| w.contains("PDF")));
    }

    #[test]
    fn test_generate_requires_a_person_and_a_template() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let service = setup(&temp_dir, Box::new(NoConverter));

        let mut nobody = request(&temp_dir, &["Kaputt.docx"], false);
        nobody.client = None;
        nobody.caretaker = None;
        assert!(matches!(
            service.generate(&nobody),
            Err(CareError::InvalidInput(_))
        ));
        assert!(matches!(
            service.generate(&request(&temp_dir, &[], false)),
            Err(CareError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_template_groups_lifecycle() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut store = ConfigStore::load(temp_dir.path()).expect("load");
        let neu = NonEmptyText::new("Neukunde").expect("name");
        let alt = NonEmptyText::new("Abschluss").expect("name");

        create_group(&mut store, &neu).expect("create");
        create_group(&mut store, &alt).expect("create");
        assert!(create_group(&mut store, &neu).is_err());

        set_group_templates(
            &mut store,
            "Neukunde",
            vec!["Vertrag/A.docx".into(), "Weg.docx".into()],
        )
        .expect("set templates");

        let renamed = NonEmptyText::new("Neue Kunden").expect("name");
        assert!(rename_group(&mut store, "Neukunde", &renamed).expect("rename"));

        let reloaded = ConfigStore::load(temp_dir.path()).expect("reload");
        let groups = list_groups(&reloaded, &["Vertrag/A.docx".to_owned()]);
        assert_eq!(groups[0].name, "Neue Kunden");
        assert_eq!(groups[0].templates, vec!["Vertrag/A.docx".to_owned()]);
        assert_eq!(groups[1].name, "Abschluss");

        assert!(delete_group(&mut store, "Abschluss").expect("delete"));
        assert!(!delete_group(&mut store, "Abschluss").expect("delete twice"));
    }
}
