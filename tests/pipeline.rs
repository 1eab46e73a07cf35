use std::collections::HashSet;
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use hicflow::{
    BuildConfig, BuildGraph, Callbacks, ComputeError, Manifest, SettingsFingerprint, Simulator,
    Workflow, WorkflowError,
};

/// Records every run and writes a structure with four segments.
#[derive(Clone, Default)]
struct Fake {
    runs: Arc<Mutex<Vec<String>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl Fake {
    fn runs(&self) -> Vec<String> {
        let mut runs = self.runs.lock().unwrap().clone();
        runs.sort();
        runs
    }

    fn reset(&self) {
        self.runs.lock().unwrap().clear();
    }

    fn fail(&self, name: &str, fail: bool) {
        let mut failing = self.failing.lock().unwrap();
        if fail {
            failing.insert(name.to_string());
        } else {
            failing.remove(name);
        }
    }
}

impl Simulator for Fake {
    fn simulate(
        &self,
        settings: &SettingsFingerprint,
        input: &Utf8Path,
        workspace: &Utf8Path,
    ) -> Result<(), ComputeError> {
        let name = input.file_stem().unwrap().to_string();
        self.runs.lock().unwrap().push(name.clone());

        fs::write(workspace.join("sim.log"), format!("simulating {name}\n")).unwrap();

        if self.failing.lock().unwrap().contains(&name) {
            return Err(ComputeError::Simulation("exit status: 1".into()));
        }

        fs::write(
            workspace.join("structure.csv"),
            format!("x,y,z\n0,0,0\n1,0,0\n2,0,0\n{},0,0\n", settings.threshold),
        )
        .unwrap();
        fs::write(workspace.join("contactmap.tsv"), "1\t2\n").unwrap();
        fs::write(workspace.join("contacts.in.tsv"), "1\t2\t5\n").unwrap();
        fs::write(workspace.join("contacts.out.tsv"), "1\t2\n").unwrap();

        Ok(())
    }
}

struct Project {
    _dir: tempfile::TempDir,
    config: BuildConfig,
    fake: Fake,
}

impl Project {
    fn new(settings: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();

        fs::create_dir_all(root.join("data")).unwrap();
        fs::write(root.join("data/first.hic"), "contacts 0").unwrap();
        fs::write(root.join("data/second.hic"), "contacts 1").unwrap();
        fs::write(root.join("data/ac.csv"), "0.1\n0.2\n").unwrap();

        let project = Self {
            _dir: dir,
            config: BuildConfig::new(root).with_concurrency(2),
            fake: Fake::default(),
        };
        project.write_spec(settings);

        // Inputs predate every output produced by the tests.
        let past = SystemTime::now() - Duration::from_secs(3600);
        for name in ["data/first.hic", "data/second.hic", "data/ac.csv", "workflow.yaml"] {
            project.set_mtime(name, past);
        }

        project
    }

    fn path(&self, name: &str) -> Utf8PathBuf {
        self.config.project_dir.join(name)
    }

    fn write_spec(&self, settings: &str) {
        let text = format!(
            "project:\n  name: Demo\n{settings}\
             datasets:\n  - name: 00hr\n    data: data/first.hic\n  - name: 12hr\n    data: data/second.hic\n\
             tracks:\n  - name: H3K27ac\n    data: data/ac.csv\n"
        );
        fs::write(self.path("workflow.yaml"), text).unwrap();
    }

    fn set_mtime(&self, name: &str, time: SystemTime) {
        fs::File::open(self.path(name))
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    fn workflow(&self) -> Workflow {
        Workflow::load(self.config.clone(), self.fake.clone()).unwrap()
    }
}

#[test]
fn test_two_datasets_end_to_end() {
    let project = Project::new("");

    let report = project.workflow().build().unwrap();

    assert_eq!(report.dispatched, vec![0, 1]);
    assert!(report.fresh.is_empty());
    assert_eq!(report.manifest, project.config.manifest_path());
    assert_eq!(project.fake.runs(), vec!["first", "second"]);

    let root = &project.config.output_root;
    assert!(root.join("lammps_0/structure.csv").is_file());
    assert!(root.join("lammps_1/contactmap.tsv").is_file());
    assert!(root.join("lammps_1/settings.json").is_file());

    let manifest = Manifest::load(&project.config).unwrap();
    assert_eq!(manifest.project.name, "Demo");
    assert_eq!(manifest.datasets.len(), 2);

    for (id, dataset) in manifest.datasets.iter().enumerate() {
        assert_eq!(dataset.id, id);
        assert_eq!(dataset.structure.id, id);
        assert_eq!(dataset.structure.contact_map, id);
        assert_eq!(manifest.data.structure[id].contact_map, id);
        assert_eq!(manifest.data.structure[id].num_segments, 4);
    }
    assert_eq!(manifest.datasets[0].name, "00hr");
    assert_eq!(manifest.datasets[1].name, "12hr");
}

#[test]
fn test_urls_are_relative_and_resolve() {
    let project = Project::new("");
    project.workflow().build().unwrap();

    let manifest = Manifest::load(&project.config).unwrap();
    let mut urls: Vec<&str> = Vec::new();
    urls.extend(manifest.data.array.iter().map(|e| e.url.as_str()));
    urls.extend(manifest.data.contact_maps.iter().map(|e| e.url.as_str()));
    urls.extend(manifest.data.structure.iter().map(|e| e.url.as_str()));
    for dataset in &manifest.datasets {
        urls.push(&dataset.structure.input_set);
        urls.push(&dataset.structure.output_set);
    }

    assert_eq!(urls.len(), 9);
    for url in urls {
        assert!(!url.starts_with('/'), "absolute url {url}");
        assert!(project.config.output_root.join(url).is_file(), "dangling url {url}");
    }
    assert_eq!(manifest.data.array[0].url, "tracks/0/ac.csv");
}

#[test]
fn test_rebuild_is_idempotent() {
    let project = Project::new("");
    project.workflow().build().unwrap();
    let first = fs::read(project.config.manifest_path()).unwrap();
    project.fake.reset();

    let report = project.workflow().build().unwrap();

    assert!(report.dispatched.is_empty());
    assert_eq!(report.fresh, vec![0, 1]);
    assert!(project.fake.runs().is_empty());
    assert_eq!(fs::read(project.config.manifest_path()).unwrap(), first);
}

#[test]
fn test_settings_change_invalidates_everything() {
    let project = Project::new("");
    project.workflow().build().unwrap();
    project.fake.reset();

    // Inputs are older than the outputs, settings still win.
    project.write_spec("  threshold: 3.0\n");
    let report = project.workflow().build().unwrap();

    assert_eq!(report.dispatched, vec![0, 1]);
    assert_eq!(project.fake.runs(), vec!["first", "second"]);
}

#[test]
fn test_display_settings_do_not_invalidate() {
    let project = Project::new("");
    project.workflow().build().unwrap();
    project.fake.reset();

    project.write_spec("  blackout: [3, 4]\n");
    let report = project.workflow().build().unwrap();

    assert!(report.dispatched.is_empty());
    let manifest = Manifest::load(&project.config).unwrap();
    assert_eq!(manifest.data.structure[1].unmapped_segments, vec![3, 4]);
}

#[test]
fn test_modified_input_invalidates_one_dataset() {
    let project = Project::new("");
    project.workflow().build().unwrap();
    project.fake.reset();

    project.set_mtime("data/second.hic", SystemTime::now() + Duration::from_secs(60));
    let report = project.workflow().build().unwrap();

    assert_eq!(report.dispatched, vec![1]);
    assert_eq!(report.fresh, vec![0]);
    assert_eq!(project.fake.runs(), vec!["second"]);
}

#[test]
fn test_failure_forces_retry() {
    let project = Project::new("");
    project.workflow().build().unwrap();
    let manifest = fs::read(project.config.manifest_path()).unwrap();
    project.fake.reset();

    project.write_spec("  timesteps: 10\n");
    project.fake.fail("second", true);

    let failure = match project.workflow().build() {
        Err(WorkflowError::Compute(failure)) => failure,
        Err(other) => panic!("expected a compute failure, got {other}"),
        Ok(report) => panic!("expected a compute failure, got {report:?}"),
    };
    assert_eq!(failure.failures.len(), 1);
    assert_eq!(failure.failures[0].index, 1);
    assert_eq!(
        failure.failures[0].log.as_deref(),
        Some(project.config.node_dir(1).join("sim.log").as_path())
    );

    // No assembly after a failed batch.
    assert_eq!(fs::read(project.config.manifest_path()).unwrap(), manifest);
    assert!(!project.config.node_dir(1).join("settings.json").exists());

    project.fake.fail("second", false);
    project.fake.reset();
    let report = project.workflow().build().unwrap();

    assert!(report.dispatched.contains(&1));
    assert!(project.fake.runs().contains(&"second".to_string()));
}

#[test]
fn test_single_dataset_compute() {
    let project = Project::new("");
    let workflow = project.workflow();

    let artifacts = workflow.compute(1).unwrap();

    assert_eq!(project.fake.runs(), vec!["second"]);
    assert!(artifacts.iter().all(|(_, path)| path.is_file()));
    assert!(hicflow::is_stale(&workflow.nodes()[0], workflow.fingerprint()));
    assert!(!hicflow::is_stale(&workflow.nodes()[1], workflow.fingerprint()));
}

#[test]
fn test_graph_agrees_with_oracle() {
    let project = Project::new("");
    let workflow = project.workflow();
    workflow.configure("hicflow", None).unwrap();
    workflow.build().unwrap();

    let project_file = project.config.project_file().unwrap();
    let dirty_rules = || {
        let workflow = project.workflow();
        let graph = BuildGraph::for_project(
            &project.config,
            &project_file,
            workflow.spec(),
            Callbacks::new("hicflow"),
        )
        .unwrap();

        let mut rules: Vec<String> = graph
            .dirty()
            .unwrap()
            .iter()
            .map(|&i| graph.statements()[i].rule.clone())
            .collect();
        rules.sort();
        (rules, workflow)
    };

    let (rules, _) = dirty_rules();
    assert!(rules.is_empty(), "left after a build: {rules:?}");

    // Display settings rerun the stamp and the manifest, no simulation.
    project.write_spec("  blackout: [1]\n");
    let (rules, workflow) = dirty_rules();
    assert_eq!(rules, vec!["assemble", "stamp"]);
    assert!(!hicflow::is_stale(&workflow.nodes()[0], workflow.fingerprint()));

    // A settings change reaches every compute statement through the stamp,
    // with no new configure step in between.
    project.write_spec("  timesteps: 10\n");
    let (rules, workflow) = dirty_rules();
    assert_eq!(rules, vec!["assemble", "compute", "compute", "stamp"]);
    assert!(workflow.nodes().iter().all(|node| hicflow::is_stale(node, workflow.fingerprint())));
}
