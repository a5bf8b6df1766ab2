use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use colored::Colorize;
use hdal_core::{Abandon, Dal, DalConfig, DataList, DataObject, Query};
use hdal_schema::SchemaFile;
use hdal_store::{InMemoryVolatileStore, JsonFileStore};
use hdal_types::Guid;
use serde_json::Value;
use tracing::info;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let dal = open(&cli)?;
    let format = cli.format;
    match cli.command {
        Command::Schema => cmd_schema(&dal, format),
        Command::Create(args) => cmd_create(&dal, args, format),
        Command::Show(args) => cmd_show(&dal, args, format),
        Command::Set(args) => cmd_set(&dal, args, format),
        Command::Delete(args) => cmd_delete(&dal, args),
        Command::List(args) => cmd_list(&dal, args, format),
    }
}

/// Build a DAL over the schema file and the JSON data file. The volatile
/// cache lives only for this invocation.
fn open(cli: &Cli) -> anyhow::Result<Dal> {
    let schema = SchemaFile::load(&cli.schema)
        .with_context(|| format!("reading schema {}", cli.schema.display()))?;
    let registry = schema.build()?;
    if let Some(hybrid) = registry.hybrids().find(|h| !h.dynamics().is_empty()) {
        bail!(
            "{} declares dynamic properties, which need bound functions and cannot be used from the command line",
            hybrid.name()
        );
    }
    let config = match &cli.config {
        Some(path) => DalConfig::load(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => DalConfig::default(),
    };
    let persistent = JsonFileStore::open(&cli.data)
        .with_context(|| format!("opening data file {}", cli.data.display()))?;
    let dal = Dal::builder(
        registry,
        Arc::new(InMemoryVolatileStore::new()),
        Arc::new(persistent),
    )
    .config(config)
    .build()?;
    Ok(dal)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_schema(dal: &Dal, format: OutputFormat) -> anyhow::Result<()> {
    let mut hybrids: Vec<_> = dal.registry().hybrids().collect();
    hybrids.sort_by(|a, b| a.logical_name().cmp(b.logical_name()));
    if format == OutputFormat::Json {
        let out: Vec<Value> = hybrids
            .iter()
            .map(|h| {
                serde_json::json!({
                    "name": h.logical_name(),
                    "type": h.name(),
                    "identifier": h.identifier(),
                    "properties": h.properties(),
                    "relations": h.relations().iter().map(|r| serde_json::json!({
                        "name": r.name,
                        "target": r.target(),
                        "mandatory": r.mandatory,
                    })).collect::<Vec<_>>(),
                    "reverse": h.foreign_relations().iter().map(|f| &f.name).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    for hybrid in hybrids {
        let stored = if hybrid.name() == hybrid.logical_name() {
            String::new()
        } else {
            format!(" (stored as {})", hybrid.name())
        };
        println!("{}{}", hybrid.logical_name().bold(), stored.dimmed());
        for p in hybrid.properties() {
            let mut flags = Vec::new();
            if p.mandatory {
                flags.push("mandatory");
            }
            if p.indexed {
                flags.push("indexed");
            }
            if p.unique {
                flags.push("unique");
            }
            println!("  {}: {} {}", p.name, p.ty.to_string().cyan(), flags.join(" ").dimmed());
        }
        for r in hybrid.relations() {
            println!("  {} -> {}", r.name, r.target().yellow());
        }
        for f in hybrid.foreign_relations() {
            println!("  {} <- {}.{}", f.name, f.child.yellow(), f.child_key);
        }
    }
    Ok(())
}

fn cmd_create(dal: &Dal, args: CreateArgs, format: OutputFormat) -> anyhow::Result<()> {
    let mut object = dal.create(&args.type_name)?;
    apply_fields(dal, &mut object, &args.fields)?;
    object.save()?;
    info!(type_name = %args.type_name, guid = %object.guid(), "created");
    match format {
        OutputFormat::Json => println!("{}", serde_json::json!({"guid": object.guid().to_string()})),
        OutputFormat::Text => println!("{} {} {}", "✓".green().bold(), args.type_name, object.guid().to_string().yellow()),
    }
    Ok(())
}

fn cmd_show(dal: &Dal, args: ShowArgs, format: OutputFormat) -> anyhow::Result<()> {
    let mut object = dal.load(&args.type_name, parse_guid(&args.guid)?)?;
    let view = object.serialize(args.depth)?;
    print_object(&view, format)
}

fn cmd_set(dal: &Dal, args: SetArgs, format: OutputFormat) -> anyhow::Result<()> {
    let mut object = dal.load(&args.type_name, parse_guid(&args.guid)?)?;
    apply_fields(dal, &mut object, &args.fields)?;
    object.save()?;
    print_object(&object.serialize(0)?, format)
}

fn cmd_delete(dal: &Dal, args: DeleteArgs) -> anyhow::Result<()> {
    let mut object = dal.load(&args.type_name, parse_guid(&args.guid)?)?;
    object.delete_with(&abandon_of(&args))?;
    println!("{} deleted {} {}", "✓".green().bold(), args.type_name, args.guid.yellow());
    Ok(())
}

fn cmd_list(dal: &Dal, args: ListArgs, format: OutputFormat) -> anyhow::Result<()> {
    let mut list = run_list(dal, &args)?;
    let mut rows = Vec::with_capacity(list.len());
    for object in list.iter() {
        let object = object?;
        let view = object.borrow().export();
        let guid = object.borrow().guid().to_string();
        rows.push((guid, view));
    }
    match format {
        OutputFormat::Json => {
            let out: Vec<Value> = rows
                .into_iter()
                .map(|(guid, mut view)| {
                    view.insert("guid".into(), Value::String(guid));
                    Value::Object(view)
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => {
            for (guid, view) in rows {
                println!("{} {}", guid.yellow(), Value::Object(view));
            }
            println!("{}", format!("{} objects", list.len()).dimmed());
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn run_list(dal: &Dal, args: &ListArgs) -> anyhow::Result<DataList> {
    let filters = args
        .filters
        .iter()
        .map(|raw| parse_assignment(raw).map(|(field, value)| Query::eq(field, value)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let query = if filters.is_empty() {
        Query::all()
    } else {
        Query::and(filters)
    };
    let mut list = dal.query(&args.type_name, query)?;
    if let Some(field) = &args.sort {
        list.sort_by_key(field, args.reverse)?;
    }
    Ok(list)
}

fn abandon_of(args: &DeleteArgs) -> Abandon {
    if args.abandon_all {
        Abandon::All
    } else if args.abandon.is_empty() {
        Abandon::Nothing
    } else {
        Abandon::Relations(args.abandon.clone())
    }
}

/// Split `field=value`. The value is read as JSON when it parses, else
/// taken as a plain string.
fn parse_assignment(raw: &str) -> anyhow::Result<(String, Value)> {
    let (field, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected field=value, got {raw:?}"))?;
    if field.is_empty() {
        bail!("empty field name in {raw:?}");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((field.to_string(), value))
}

fn parse_guid(raw: &str) -> anyhow::Result<Guid> {
    Guid::parse(raw).map_err(|e| anyhow!("{e}"))
}

/// Apply assignments; a relation takes the guid of its target, or `null`.
fn apply_fields(dal: &Dal, object: &mut DataObject, fields: &[String]) -> anyhow::Result<()> {
    for raw in fields {
        let (field, value) = parse_assignment(raw)?;
        let Some(relation) = object.hybrid().relation(&field).cloned() else {
            object.set(&field, value)?;
            continue;
        };
        match value {
            Value::Null => object.set_relation(&field, None)?,
            Value::String(guid) => {
                let target = dal.load(relation.target(), parse_guid(&guid)?)?;
                object.set_relation(&field, Some(&target))?;
            }
            other => bail!("{field} is a relation and takes a guid, got {other}"),
        }
    }
    Ok(())
}

fn print_object(view: &Value, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(view)?),
        OutputFormat::Text => {
            if let Value::Object(fields) = view {
                for (name, value) in fields {
                    println!("{}: {}", name.bold(), value);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use hdal_core::IndexUsage;
    use serde_json::json;
    use std::path::Path;

    const SCHEMA: &str = r#"
[[types]]
name = "StorageRouter"

[[types.properties]]
name = "name"
type = "str"
indexed = true

[[types]]
name = "Disk"

[[types.properties]]
name = "name"
type = "str"
indexed = true

[[types.properties]]
name = "size"
type = "int"
mandatory = false

[[types.relations]]
name = "storagerouter"
foreign_type = "StorageRouter"
foreign_key = "disks"
mandatory = false
"#;

    fn cli(dir: &Path, args: &[&str]) -> Cli {
        let schema = dir.join("schema.toml");
        let data = dir.join("data.json");
        let mut argv = vec![
            "hdal".to_string(),
            "--schema".to_string(),
            schema.display().to_string(),
            "--data".to_string(),
            data.display().to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        Cli::parse_from(argv)
    }

    fn setup() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("schema.toml"), SCHEMA).unwrap();
        dir
    }

    #[test]
    fn assignments_parse_json_or_text() {
        assert_eq!(parse_assignment("size=10").unwrap(), ("size".into(), json!(10)));
        assert_eq!(parse_assignment("name=sda").unwrap(), ("name".into(), json!("sda")));
        assert_eq!(parse_assignment("name=a=b").unwrap(), ("name".into(), json!("a=b")));
        assert_eq!(parse_assignment("size=null").unwrap(), ("size".into(), Value::Null));
        assert!(parse_assignment("size").is_err());
        assert!(parse_assignment("=1").is_err());
    }

    #[test]
    fn abandon_flags() {
        let dir = setup();
        let args = |extra: &[&str]| match cli(dir.path(), extra).command {
            Command::Delete(args) => abandon_of(&args),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(args(&["delete", "Disk", "x"]), Abandon::Nothing);
        assert_eq!(args(&["delete", "Disk", "x", "--abandon-all"]), Abandon::All);
        assert_eq!(
            args(&["delete", "Disk", "x", "--abandon", "disks"]),
            Abandon::Relations(vec!["disks".into()])
        );
    }

    #[test]
    fn objects_persist_across_invocations() {
        let dir = setup();
        let first = open(&cli(dir.path(), &["schema"])).unwrap();
        let mut router = first.create("StorageRouter").unwrap();
        apply_fields(&first, &mut router, &["name=node1".into()]).unwrap();
        router.save().unwrap();
        let mut disk = first.create("Disk").unwrap();
        let link = format!("storagerouter={}", router.guid());
        apply_fields(&first, &mut disk, &["name=sda".into(), "size=3".into(), link]).unwrap();
        disk.save().unwrap();

        let second = open(&cli(dir.path(), &["schema"])).unwrap();
        let loaded = second.load("Disk", disk.guid()).unwrap();
        assert_eq!(loaded.get("size").unwrap(), &json!(3));
        assert_eq!(loaded.relation_guid("storagerouter").unwrap(), Some(router.guid()));

        let args = ListArgs {
            type_name: "Disk".into(),
            filters: vec!["name=sda".into()],
            sort: None,
            reverse: false,
        };
        let list = run_list(&second, &args).unwrap();
        assert_eq!(list.guids(), &[disk.guid()]);
        assert_eq!(list.index_usage(), IndexUsage::Full);
    }

    #[test]
    fn relation_fields_take_guids() {
        let dir = setup();
        let dal = open(&cli(dir.path(), &["schema"])).unwrap();
        let mut disk = dal.create("Disk").unwrap();
        assert!(apply_fields(&dal, &mut disk, &["storagerouter=5".into()]).is_err());
        assert!(apply_fields(&dal, &mut disk, &["storagerouter=nope".into()]).is_err());
        apply_fields(&dal, &mut disk, &["storagerouter=null".into()]).unwrap();
        assert_eq!(disk.relation_guid("storagerouter").unwrap(), None);
    }

    #[test]
    fn schemas_with_dynamics_are_rejected() {
        let dir = setup();
        let with_dynamic = format!(
            "{SCHEMA}\n[[types.dynamics]]\nname = \"label\"\nreturn_type = \"str\"\nttl = 10\n"
        );
        std::fs::write(dir.path().join("schema.toml"), with_dynamic).unwrap();
        let err = open(&cli(dir.path(), &["schema"])).unwrap_err();
        assert!(err.to_string().contains("dynamic"));
    }
}
