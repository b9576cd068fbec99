use pnadc_fetch::{
    fetch::{HtmlDirectoryLister, HttpTransport, ResourceKind},
    PipelineConfig, RunParams, RunPaths, StageOutcome,
};
use rust_xlsxwriter::Workbook;
use std::{fs, io::Write, time::Duration};
use tempfile::tempdir;
use wiremock::{matchers::path, Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;

const SAS_INPUT: &str = "\
input
@0001 Ano $4.
@0005 Trimestre $1.
@0006 UF $2.
@0008 V2009 3.
;
";

const RECORDS: &str = "2024135040\r\n2024111027\r\n2024253061\r\n";

fn zipped(name: &str, body: &str) -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    let mut zw = zip::ZipWriter::new(&mut buf);
    zw.start_file(name, SimpleFileOptions::default()).unwrap();
    zw.write_all(body.as_bytes()).unwrap();
    zw.finish().unwrap();
    buf.into_inner()
}

enum Cell {
    Text(&'static str),
    Num(f64),
}

fn workbook(rows: &[Vec<Cell>]) -> Vec<u8> {
    let mut book = Workbook::new();
    let sheet = book.add_worksheet();
    for (r, row) in rows.iter().enumerate() {
        for (c, cell) in row.iter().enumerate() {
            let written = match cell {
                Cell::Text(t) => sheet.write_string(r as u32, c as u16, *t).map(|_| ()),
                Cell::Num(n) => sheet.write_number(r as u32, c as u16, *n).map(|_| ()),
            };
            written.unwrap();
        }
    }
    book.save_to_buffer().unwrap()
}

fn dictionary() -> Vec<u8> {
    use Cell::*;
    workbook(&[
        vec![Text("Dicionário das variáveis da PNAD Contínua")],
        vec![Text("Posição Inicial"), Text("Tamanho"), Text("Código da variável")],
        vec![Num(1.0), Num(4.0), Text("Ano")],
        vec![Num(5.0), Num(1.0), Text("Trimestre")],
        vec![Num(6.0), Num(2.0), Text("UF")],
        vec![Num(8.0), Num(3.0), Text("V2009")],
    ])
}

fn deflator() -> Vec<u8> {
    use Cell::*;
    let header = ["ano", "trim", "uf", "CO1", "CO1e", "CO2", "CO2e", "CO3"];
    let mut rows = vec![header.iter().map(|&h| Text(h)).collect::<Vec<_>>()];
    rows.push(vec![Num(2024.0), Num(1.0), Num(35.0), Num(1.05), Num(1.06), Num(1.07), Num(1.08), Num(1.09)]);
    rows.push(vec![Num(2024.0), Num(1.0), Num(11.0), Num(0.95), Num(0.96), Num(0.97), Num(0.98), Num(0.99)]);
    workbook(&rows)
}

fn config_for(server: &MockServer, root: &std::path::Path) -> PipelineConfig {
    PipelineConfig {
        root_dir: root.to_path_buf(),
        data_base_url: format!("{}/Visita_{{visit}}/Dados/", server.uri()),
        docs_base_url: format!("{}/Visita_{{visit}}/Documentacao/", server.uri()),
        deflator_base_url: format!("{}/Documentacao_Geral/", server.uri()),
        ..PipelineConfig::default()
    }
}

async fn serve(server: &MockServer, route: &str, body: Vec<u8>) {
    Mock::given(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn full_run_against_http_server() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let server = MockServer::start().await;
    // the archive is only found through the directory listing
    serve(
        &server,
        "/Visita_1/Dados/",
        br#"<html><a href="PNADC_2024_visita1_20250901.zip">zip</a>
<a href="PNADC_2024_visita1_20250101.zip">old</a></html>"#
            .to_vec(),
    )
    .await;
    serve(
        &server,
        "/Visita_1/Dados/PNADC_2024_visita1_20250901.zip",
        zipped("PNADC_2024_visita1.txt", RECORDS),
    )
    .await;
    serve(
        &server,
        "/Visita_1/Documentacao/input_PNADC_2024_visita1.txt",
        SAS_INPUT.as_bytes().to_vec(),
    )
    .await;

    let root = tempdir().unwrap();
    let cfg = config_for(&server, root.path());
    let params = RunParams::new(2024, 1, 2024).unwrap();
    let transport = HttpTransport::new(Duration::from_secs(5), Duration::from_secs(5)).unwrap();
    let lister = HtmlDirectoryLister::new(transport.clone());

    let report = pnadc_fetch::run(&params, &cfg, &transport, &lister)
        .await
        .unwrap();

    assert!(report.downloaded(ResourceKind::Microdata));
    assert!(report.downloaded(ResourceKind::InputLayout));
    assert!(!report.downloaded(ResourceKind::Dictionary));
    assert!(!report.downloaded(ResourceKind::Deflator));
    assert_eq!(report.extracted, StageOutcome::Done);
    assert_eq!(report.written, StageOutcome::Done);

    let paths = RunPaths::new(root.path(), &params);
    let out = paths.data_dir.join("PNADC_2024_visita1_final.csv");
    assert_eq!(report.output.as_deref(), Some(out.as_path()));

    let text = fs::read_to_string(&out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines,
        vec![
            "Ano;Trimestre;UF;V2009",
            "2024;1;35;040",
            "2024;1;11;027",
            "2024;2;53;061",
        ]
    );

    assert!(!paths.data_dir.join("PNADC_2024_visita1_20250901.zip").exists());
    assert!(!paths.data_dir.join("PNADC_2024_visita1.txt").exists());
    assert!(paths
        .docs_dir
        .join("input_PNADC_2024_visita1.txt")
        .exists());
}

#[tokio::test]
async fn dictionary_and_deflator_from_workbooks() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let server = MockServer::start().await;
    serve(
        &server,
        "/Visita_1/Dados/PNADC_2024_visita1.zip",
        zipped("PNADC_2024_visita1.txt", RECORDS),
    )
    .await;
    serve(
        &server,
        "/Visita_1/Documentacao/dicionario_PNADC_microdados_2024_visita1.xls",
        dictionary(),
    )
    .await;
    serve(&server, "/Documentacao_Geral/deflator_PNADC_2024.xls", deflator()).await;

    let root = tempdir().unwrap();
    let cfg = config_for(&server, root.path());
    let params = RunParams::new(2024, 1, 2024).unwrap();
    let transport = HttpTransport::new(Duration::from_secs(5), Duration::from_secs(5)).unwrap();
    let lister = HtmlDirectoryLister::new(transport.clone());

    let report = pnadc_fetch::run(&params, &cfg, &transport, &lister)
        .await
        .unwrap();

    assert!(report.downloaded(ResourceKind::Dictionary));
    assert!(report.downloaded(ResourceKind::Deflator));
    assert!(!report.downloaded(ResourceKind::InputLayout));
    assert_eq!(report.merged, StageOutcome::Done);

    let out = report.output.expect("output written");
    let text = fs::read_to_string(&out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines,
        vec![
            "Ano;Trimestre;UF;V2009;CO1;CO1e;CO2;CO2e;CO3",
            "2024;1;35;040;1.05;1.06;1.07;1.08;1.09",
            "2024;1;11;027;0.95;0.96;0.97;0.98;0.99",
            "2024;2;53;061;;;;;",
        ]
    );
}

#[tokio::test]
async fn second_run_on_locked_directory_is_rejected() {
    let root = tempdir().unwrap();
    let cfg = PipelineConfig {
        root_dir: root.path().to_path_buf(),
        ..PipelineConfig::default()
    };
    let params = RunParams::new(2024, 1, 2024).unwrap();
    let paths = RunPaths::new(root.path(), &params);
    paths.create().unwrap();
    let _held = pnadc_fetch::RunLock::acquire(&paths.run_dir).unwrap();

    let transport = HttpTransport::new(Duration::from_secs(1), Duration::from_secs(1)).unwrap();
    let lister = HtmlDirectoryLister::new(transport.clone());
    let err = pnadc_fetch::run(&params, &cfg, &transport, &lister)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<pnadc_fetch::PnadcError>(),
        Some(pnadc_fetch::PnadcError::RunLocked(_))
    ));
}
